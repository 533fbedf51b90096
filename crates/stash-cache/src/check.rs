use rusqlite::types::Value as SqlValue;
use rusqlite::params;
use serde::Serialize;
use std::collections::HashSet;
use std::path::PathBuf;

use crate::cache::Cache;
use crate::codec::CacheKey;
use crate::error::Result;
use crate::store::DATABASE_NAME;

/// One consistency finding from [`Cache::check`].
#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum CheckFinding {
    /// `Settings.count` disagrees with the number of rows.
    CountMismatch { recorded: i64, actual: i64 },
    /// `Settings.size` disagrees with the sum of row sizes.
    SizeMismatch { recorded: i64, actual: i64 },
    /// A reservation row whose write never committed.
    UncommittedRow { rowid: i64, key: String },
    /// A row references a value file that is gone.
    MissingFile { rowid: i64, path: PathBuf },
    /// A value file not referenced by any row.
    UnreferencedFile { path: PathBuf },
    /// A directory with no files or subdirectories.
    EmptyDirectory { path: PathBuf },
}

/// Summary of a consistency check.
///
/// Findings are repairs that were applied (with `fix`) or would be applied.
/// Integrity errors come from the store's own integrity check and are never
/// repaired here beyond compaction.
#[derive(Clone, Debug, Default, Serialize)]
pub struct CheckReport {
    pub fix: bool,
    pub integrity_errors: Vec<String>,
    pub findings: Vec<CheckFinding>,
    /// Bytes found on disk for referenced value files.
    pub external_bytes: u64,
}

impl CheckReport {
    fn push(&mut self, finding: CheckFinding) {
        tracing::warn!(target = "stash.cache", finding = ?finding, "consistency finding");
        self.findings.push(finding);
    }

    pub fn is_clean(&self) -> bool {
        self.integrity_errors.is_empty() && self.findings.is_empty()
    }
}

impl Cache {
    /// Check database and file system consistency.
    ///
    /// With `fix` set: repairs counters, deletes reservation rows and rows
    /// whose value file is gone, removes unreferenced value files and empty
    /// directories, and compacts the store.
    pub fn check(&mut self, fix: bool) -> Result<CheckReport> {
        let mut report = CheckReport {
            fix,
            ..CheckReport::default()
        };

        self.check_integrity(&mut report)?;
        self.check_reservations(fix, &mut report)?;
        self.check_count(fix, &mut report)?;
        let referenced = self.check_row_files(fix, &mut report)?;
        self.check_size(fix, &mut report)?;
        self.check_tree(fix, &referenced, &mut report)?;

        if fix {
            self.store().conn().execute_batch("VACUUM")?;
        }

        Ok(report)
    }

    fn check_integrity(&self, report: &mut CheckReport) -> Result<()> {
        let rows = {
            let mut stmt = self.store().conn().prepare("PRAGMA integrity_check")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        if rows.len() != 1 || rows[0] != "ok" {
            for message in rows {
                tracing::warn!(target = "stash.cache", %message, "integrity check failed");
                report.integrity_errors.push(message);
            }
        }

        Ok(())
    }

    fn check_reservations(&self, fix: bool, report: &mut CheckReport) -> Result<()> {
        let rows = {
            let mut stmt = self.store().conn().prepare(
                "SELECT rowid, key, raw, version, filename FROM Cache \
                 WHERE store_time IS NULL",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, SqlValue>(1)?,
                    row.get::<_, bool>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, Option<String>>(4)?,
                ))
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        for (rowid, db_key, raw, version, filename) in rows {
            let key = match CacheKey::decode(db_key, raw) {
                Some(key) => format!("{key:?}"),
                None => "<unreadable>".to_string(),
            };
            report.push(CheckFinding::UncommittedRow { rowid, key });

            if fix {
                self.delete_row(rowid, version, filename.as_deref())?;
            }
        }

        Ok(())
    }

    fn check_count(&self, fix: bool, report: &mut CheckReport) -> Result<()> {
        let recorded = self.store().read_counter("count")?;
        let actual: i64 = self
            .store()
            .conn()
            .query_row("SELECT COUNT(key) FROM Cache", [], |row| row.get(0))?;

        if recorded != actual {
            report.push(CheckFinding::CountMismatch { recorded, actual });
            if fix {
                self.store().put_counter("count", actual)?;
            }
        }

        Ok(())
    }

    /// Walk the table in chunks, verifying each referenced file exists.
    /// Returns the set of full paths referenced by surviving rows.
    fn check_row_files(&self, fix: bool, report: &mut CheckReport) -> Result<HashSet<PathBuf>> {
        let chunk = self.store().settings().cull_limit;
        let mut referenced = HashSet::new();
        let mut cursor = 0i64;

        loop {
            let rows = {
                let mut stmt = self.store().conn().prepare(
                    "SELECT rowid, version, filename FROM Cache \
                     WHERE rowid > ?1 AND filename IS NOT NULL \
                     ORDER BY rowid LIMIT ?2",
                )?;
                let rows = stmt.query_map(params![cursor, chunk], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            };

            if rows.is_empty() {
                return Ok(referenced);
            }

            for (rowid, version, filename) in rows {
                cursor = rowid;
                let full_path = self.files().full_path(&filename);

                match std::fs::metadata(&full_path) {
                    Ok(meta) => {
                        report.external_bytes += meta.len();
                        referenced.insert(full_path);
                    }
                    Err(_) => {
                        report.push(CheckFinding::MissingFile {
                            rowid,
                            path: full_path,
                        });
                        if fix {
                            self.delete_row(rowid, version, Some(&filename))?;
                        }
                    }
                }
            }
        }
    }

    fn check_size(&self, fix: bool, report: &mut CheckReport) -> Result<()> {
        let recorded = self.store().read_counter("size")?;
        let actual: i64 = self.store().conn().query_row(
            "SELECT COALESCE(SUM(size), 0) FROM Cache",
            [],
            |row| row.get(0),
        )?;

        if recorded != actual {
            report.push(CheckFinding::SizeMismatch { recorded, actual });
            if fix {
                self.store().put_counter("size", actual)?;
            }
        }

        Ok(())
    }

    /// Walk the directory tree: report files no row references and empty
    /// directories. Database files are left alone. Visiting contents first
    /// lets directory removal cascade upward in a single pass.
    fn check_tree(
        &self,
        fix: bool,
        referenced: &HashSet<PathBuf>,
        report: &mut CheckReport,
    ) -> Result<()> {
        for entry in walkdir::WalkDir::new(self.directory()).contents_first(true) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    tracing::warn!(
                        target = "stash.cache",
                        error = %err,
                        "failed to walk cache directory"
                    );
                    continue;
                }
            };
            let path = entry.path();

            if entry.file_type().is_file() {
                let name = entry.file_name().to_string_lossy();
                if name.contains(DATABASE_NAME) {
                    continue;
                }
                if referenced.contains(path) {
                    continue;
                }

                report.push(CheckFinding::UnreferencedFile {
                    path: path.to_path_buf(),
                });
                if fix {
                    std::fs::remove_file(path)?;
                }
            } else if entry.file_type().is_dir() && path != self.directory() {
                let mut children = std::fs::read_dir(path)?;
                if children.next().is_none() {
                    report.push(CheckFinding::EmptyDirectory {
                        path: path.to_path_buf(),
                    });
                    if fix {
                        std::fs::remove_dir(path)?;
                    }
                }
            }
        }

        Ok(())
    }
}
