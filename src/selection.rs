use crate::entry::ImageEntry;

/// Decides whether a leaf entry gets extracted. Implementations must be pure.
pub trait SelectionPredicate {
    fn accept(&self, entry: &ImageEntry) -> bool;
}

impl<F> SelectionPredicate for F
where
    F: Fn(&ImageEntry) -> bool,
{
    fn accept(&self, entry: &ImageEntry) -> bool {
        self(entry)
    }
}

/// Accepts non-directory entries whose name ends with one of the configured
/// extensions. Matching is case-sensitive and includes the `.` separator, so
/// `.ttf` matches `arial.ttf` and a file named just `.ttf`, but neither
/// `ARIAL.TTF` nor `arialttf`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionFilter {
    extensions: Vec<String>,
}

impl ExtensionFilter {
    /// Builds a filter; `ttf` and `.ttf` are the same rule. Empty strings are
    /// ignored.
    pub fn new<I, S>(extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let extensions = extensions
            .into_iter()
            .filter_map(|ext| normalize_extension(ext.as_ref()))
            .collect();
        Self { extensions }
    }

    pub fn single(extension: &str) -> Self {
        Self::new([extension])
    }

    pub fn extensions(&self) -> &[String] {
        &self.extensions
    }

    /// Name-only check, used for container candidates and destination names.
    pub fn matches_name(&self, name: &str) -> bool {
        self.extensions
            .iter()
            .any(|ext| name.ends_with(ext.as_str()))
    }
}

impl SelectionPredicate for ExtensionFilter {
    fn accept(&self, entry: &ImageEntry) -> bool {
        !entry.is_dir && self.matches_name(&entry.name)
    }
}

fn normalize_extension(ext: &str) -> Option<String> {
    let ext = ext.trim();
    if ext.is_empty() || ext == "." {
        return None;
    }
    if ext.starts_with('.') {
        Some(ext.to_string())
    } else {
        Some(format!(".{}", ext))
    }
}
