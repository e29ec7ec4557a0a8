//! Guest selection.

/// Include/exclude filter on guest names.
///
/// A non-empty include list wins: only the listed guests are exported. Otherwise
/// every guest not on the exclude list is.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GuestFilter {
    include: Vec<String>,
    exclude: Vec<String>,
}

impl GuestFilter {
    pub fn new<I, E>(include: I, exclude: E) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
        E: IntoIterator,
        E::Item: Into<String>,
    {
        Self {
            include: clean(include),
            exclude: clean(exclude),
        }
    }

    /// Build a filter from comma-separated name lists.
    pub fn from_csv(include: &str, exclude: &str) -> Self {
        Self::new(include.split(','), exclude.split(','))
    }

    pub fn include(&self) -> &[String] {
        &self.include
    }

    pub fn exclude(&self) -> &[String] {
        &self.exclude
    }

    pub fn allows(&self, guest_name: &str) -> bool {
        if !self.include.is_empty() {
            return self.include.iter().any(|n| n == guest_name);
        }
        !self.exclude.iter().any(|n| n == guest_name)
    }
}

fn clean<I>(names: I) -> Vec<String>
where
    I: IntoIterator,
    I::Item: Into<String>,
{
    names
        .into_iter()
        .map(Into::into)
        .map(|n: String| n.trim().to_string())
        .filter(|n| !n.is_empty())
        .collect()
}
