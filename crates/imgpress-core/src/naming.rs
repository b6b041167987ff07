//! Output naming rules.
//!
//! Every compressed output is named `compressed_<base>.<ext>`, where `<base>`
//! is the source file name without its extension and `<ext>` comes from the
//! target format (or from the source when the format is
//! [`TargetFormat::Original`]). The rule is a pure function of the source name
//! and the format.
//!
//! [`EntryNamer`] resolves collisions inside a single archive by inserting a
//! counter before the extension: `compressed_photo.png`,
//! `compressed_photo(1).png`, `compressed_photo(2).png`, ...

use crate::TargetFormat;
use std::collections::HashSet;

const OUTPUT_PREFIX: &str = "compressed_";

/// Returns the last path component of a client-supplied name. Both `/` and
/// `\` count as separators since uploads come from arbitrary platforms.
pub fn file_name(name: &str) -> &str {
    name.rsplit(['/', '\\']).next().unwrap_or(name)
}

/// Splits a file name into `(stem, extension)`.
///
/// A leading dot does not start an extension (`.hidden` has none), and a
/// trailing dot yields an empty extension.
fn split_extension(name: &str) -> (&str, Option<&str>) {
    match name.rfind('.') {
        Some(0) | None => (name, None),
        Some(idx) => (&name[..idx], Some(&name[idx + 1..])),
    }
}

/// Derives the output name for a successfully compressed `source_name`.
pub fn output_name(source_name: &str, format: TargetFormat) -> String {
    let (base, source_ext) = split_extension(file_name(source_name));
    match format.extension().or(source_ext) {
        Some(ext) if !ext.is_empty() => format!("{OUTPUT_PREFIX}{base}.{ext}"),
        _ => format!("{OUTPUT_PREFIX}{base}"),
    }
}

/// Tracks the names already used in one archive and hands out unique ones.
///
/// Deterministic for a given sequence of requests: the same names assigned
/// in the same order always resolve identically.
#[derive(Debug, Default)]
pub struct EntryNamer {
    used: HashSet<String>,
}

impl EntryNamer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `name` if unused, otherwise the first free `stem(n).ext` with
    /// `n >= 1`. The returned name is recorded as used.
    pub fn assign(&mut self, name: &str) -> String {
        if self.used.insert(name.to_string()) {
            return name.to_string();
        }

        let (stem, ext) = split_extension(name);
        let mut n = 1_usize;
        loop {
            let candidate = match ext {
                Some(ext) => format!("{stem}({n}).{ext}"),
                None => format!("{stem}({n})"),
            };
            if self.used.insert(candidate.clone()) {
                return candidate;
            }
            n += 1;
        }
    }

    pub fn len(&self) -> usize {
        self.used.len()
    }

    pub fn is_empty(&self) -> bool {
        self.used.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_extension_for_explicit_formats() {
        assert_eq!(output_name("photo.jpg", TargetFormat::Png), "compressed_photo.png");
        assert_eq!(output_name("photo.png", TargetFormat::Jpeg), "compressed_photo.jpg");
        assert_eq!(output_name("photo.png", TargetFormat::Webp), "compressed_photo.webp");
        assert_eq!(output_name("photo.png", TargetFormat::Avif), "compressed_photo.avif");
    }

    #[test]
    fn original_keeps_source_extension() {
        assert_eq!(output_name("Photo.JPEG", TargetFormat::Original), "compressed_Photo.JPEG");
        assert_eq!(
            output_name("archive.tar.png", TargetFormat::Original),
            "compressed_archive.tar.png"
        );
    }

    #[test]
    fn names_without_extension() {
        assert_eq!(output_name("scan", TargetFormat::Original), "compressed_scan");
        assert_eq!(output_name("scan", TargetFormat::Png), "compressed_scan.png");
        assert_eq!(output_name(".hidden", TargetFormat::Original), "compressed_.hidden");
        assert_eq!(output_name("trailing.", TargetFormat::Original), "compressed_trailing");
    }

    #[test]
    fn naming_is_stable_across_calls() {
        let first = output_name("holiday.webp", TargetFormat::Jpeg);
        for _ in 0..10 {
            assert_eq!(output_name("holiday.webp", TargetFormat::Jpeg), first);
        }
    }

    #[test]
    fn ignores_directory_components() {
        assert_eq!(output_name("a/b/c.png", TargetFormat::Original), "compressed_c.png");
        assert_eq!(output_name("a\\b\\c.png", TargetFormat::Webp), "compressed_c.webp");
    }

    #[test]
    fn namer_suffixes_duplicates_before_extension() {
        let mut namer = EntryNamer::new();
        assert_eq!(namer.assign("compressed_photo.png"), "compressed_photo.png");
        assert_eq!(namer.assign("compressed_photo.png"), "compressed_photo(1).png");
        assert_eq!(namer.assign("compressed_photo.png"), "compressed_photo(2).png");
        assert_eq!(namer.assign("compressed_scan"), "compressed_scan");
        assert_eq!(namer.assign("compressed_scan"), "compressed_scan(1)");
        assert_eq!(namer.len(), 5);
    }

    #[test]
    fn namer_skips_names_taken_by_real_entries() {
        let mut namer = EntryNamer::new();
        assert_eq!(namer.assign("a(1).png"), "a(1).png");
        assert_eq!(namer.assign("a.png"), "a.png");
        assert_eq!(namer.assign("a.png"), "a(2).png");
    }
}
