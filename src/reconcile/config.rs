use anyhow::{bail, Result};

use crate::legacy::reader::DEFAULT_PROBE_BYTES;
use crate::legacy::record::PathPrefixes;
use crate::util::env;

pub const DEFAULT_BATCH_SIZE: usize = 500;

/// One derived key shape probed when a page's content lives in a separate store.
///
/// `Book*` forms use the raw book name, `Slug*` forms use the book slug.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateForm {
    /// `{book}/{n}`
    BookSlashNumber,
    /// `{book}/page-{n}`
    BookSlashPage,
    /// `{book}_page_{n}`
    BookPage,
    /// `{slug}_page_{n}`
    SlugPage,
    /// `{book}_עמוד_{n}`
    BookAmud,
    /// `{book}_{n}`
    BookUnderscore,
    /// `{slug}_{n}`
    SlugUnderscore,
    /// `{book}-{n}`
    BookHyphen,
    /// `{slug}-{n}`
    SlugHyphen,
}

impl CandidateForm {
    pub const DEFAULT_ORDER: [CandidateForm; 9] = [
        CandidateForm::BookSlashNumber,
        CandidateForm::BookSlashPage,
        CandidateForm::BookPage,
        CandidateForm::SlugPage,
        CandidateForm::BookAmud,
        CandidateForm::BookUnderscore,
        CandidateForm::SlugUnderscore,
        CandidateForm::BookHyphen,
        CandidateForm::SlugHyphen,
    ];

    pub fn render(self, book: &str, slug: &str, n: i64) -> String {
        match self {
            CandidateForm::BookSlashNumber => format!("{book}/{n}"),
            CandidateForm::BookSlashPage => format!("{book}/page-{n}"),
            CandidateForm::BookPage => format!("{book}_page_{n}"),
            CandidateForm::SlugPage => format!("{slug}_page_{n}"),
            CandidateForm::BookAmud => format!("{book}_עמוד_{n}"),
            CandidateForm::BookUnderscore => format!("{book}_{n}"),
            CandidateForm::SlugUnderscore => format!("{slug}_{n}"),
            CandidateForm::BookHyphen => format!("{book}-{n}"),
            CandidateForm::SlugHyphen => format!("{slug}-{n}"),
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Some(match raw.trim() {
            "book/n" => CandidateForm::BookSlashNumber,
            "book/page-n" => CandidateForm::BookSlashPage,
            "book_page_n" => CandidateForm::BookPage,
            "slug_page_n" => CandidateForm::SlugPage,
            "book_amud_n" => CandidateForm::BookAmud,
            "book_n" => CandidateForm::BookUnderscore,
            "slug_n" => CandidateForm::SlugUnderscore,
            "book-n" => CandidateForm::BookHyphen,
            "slug-n" => CandidateForm::SlugHyphen,
            _ => return None,
        })
    }

    /// Parse a comma-separated policy such as `book/n,book_page_n,slug-n`.
    pub fn parse_list(raw: &str) -> Result<Vec<Self>> {
        let mut out = Vec::new();
        for part in raw.split(',').filter(|p| !p.trim().is_empty()) {
            match Self::parse(part) {
                Some(form) if !out.contains(&form) => out.push(form),
                Some(_) => {}
                None => bail!("unknown content candidate form '{}'", part.trim()),
            }
        }
        if out.is_empty() {
            bail!("content candidate policy is empty");
        }
        Ok(out)
    }
}

#[derive(Debug, Clone)]
pub struct MigrationConfig {
    /// Rows per bulk write and documents between cancellation checks.
    pub batch_size: usize,
    /// Bytes the export reader spends in line mode before trusting the brace scanner.
    pub probe_bytes: usize,
    pub dry_run: bool,
    /// Soft-error count above which the run is reported as failed.
    pub max_soft_errors: Option<u64>,
    pub prefixes: PathPrefixes,
    pub content_candidates: Vec<CandidateForm>,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            probe_bytes: DEFAULT_PROBE_BYTES,
            dry_run: false,
            max_soft_errors: None,
            prefixes: PathPrefixes::default(),
            content_candidates: CandidateForm::DEFAULT_ORDER.to_vec(),
        }
    }
}

impl MigrationConfig {
    /// Defaults overridden by MIGRATION_BATCH_SIZE, MIGRATION_PROBE_BYTES,
    /// DRY_RUN, MAX_SOFT_ERRORS and CONTENT_CANDIDATES.
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self {
            batch_size: env::env_parse("MIGRATION_BATCH_SIZE", DEFAULT_BATCH_SIZE),
            probe_bytes: env::env_parse("MIGRATION_PROBE_BYTES", DEFAULT_PROBE_BYTES),
            dry_run: env::env_flag("DRY_RUN", false),
            max_soft_errors: env::env_parse_opt("MAX_SOFT_ERRORS"),
            ..Self::default()
        };
        if let Some(raw) = env::env_opt("CONTENT_CANDIDATES") {
            cfg.content_candidates = CandidateForm::parse_list(&raw)?;
        }
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            bail!("batch size must be positive");
        }
        if self.probe_bytes == 0 {
            bail!("probe window must be positive");
        }
        if self.content_candidates.is_empty() {
            bail!("content candidate policy is empty");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_every_form() {
        let rendered: Vec<String> = CandidateForm::DEFAULT_ORDER
            .iter()
            .map(|f| f.render("ספר א", "ספר-א", 3))
            .collect();
        assert_eq!(
            rendered,
            vec![
                "ספר א/3",
                "ספר א/page-3",
                "ספר א_page_3",
                "ספר-א_page_3",
                "ספר א_עמוד_3",
                "ספר א_3",
                "ספר-א_3",
                "ספר א-3",
                "ספר-א-3",
            ]
        );
    }

    #[test]
    fn parse_list_dedupes_and_rejects_unknown() {
        let forms = CandidateForm::parse_list("book_n, slug-n,book_n").unwrap();
        assert_eq!(forms, vec![CandidateForm::BookUnderscore, CandidateForm::SlugHyphen]);
        assert!(CandidateForm::parse_list("book_n,nope").is_err());
        assert!(CandidateForm::parse_list(" , ").is_err());
    }

    #[test]
    fn validate_rejects_zero_batch() {
        let cfg = MigrationConfig {
            batch_size: 0,
            ..MigrationConfig::default()
        };
        assert!(cfg.validate().is_err());
        assert!(MigrationConfig::default().validate().is_ok());
    }
}
