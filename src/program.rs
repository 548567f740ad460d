use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Error, anyhow, bail};
use chrono::Utc;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::config::AppConfig;
use crate::database::{Database, FileIndex, IndexRecord, Setting, SettingsStore};
use crate::io::{BufferedWriter, DuplicateFilter, MemoryFilter, WriterError, WriterStats};

/// Outcome of one import run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportSummary {
    pub files_queued: u64,
    /// Files found but not readable.
    pub files_unreadable: u64,
    /// Directory entries the walk could not visit.
    pub walk_errors: u64,
    pub stats: WriterStats,
}

impl fmt::Display for ImportSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Files queued:     {}", self.files_queued)?;
        writeln!(f, "Files unreadable: {}", self.files_unreadable)?;
        writeln!(f, "Walk errors:      {}", self.walk_errors)?;
        writeln!(
            f,
            "Saved:     {} files, {}",
            self.stats.files_saved,
            format_bytes(self.stats.bytes_saved)
        )?;
        writeln!(
            f,
            "Discarded: {} files, {}",
            self.stats.files_discarded,
            format_bytes(self.stats.bytes_discarded)
        )?;
        write!(
            f,
            "Failed:    {} files, {}",
            self.stats.files_failed,
            format_bytes(self.stats.bytes_failed)
        )
    }
}

/// State of the persistent file index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexReport {
    pub database: PathBuf,
    pub schema_version: Option<String>,
    pub indexed_files: u64,
    pub last_import: Option<String>,
    pub record: Option<IndexRecord>,
}

impl fmt::Display for IndexReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Database:       {}", self.database.display())?;
        writeln!(f, "Schema version: {}", self.schema_version.as_deref().unwrap_or("unknown"))?;
        writeln!(f, "Indexed files:  {}", self.indexed_files)?;
        write!(f, "Last import:    {}", self.last_import.as_deref().unwrap_or("never"))?;

        if let Some(record) = &self.record {
            write!(
                f,
                "\n{}: {} ({}) saved {}",
                record.key,
                format_bytes(record.size),
                record.blake3.as_deref().unwrap_or("no hash"),
                record.persisted_at.as_deref().unwrap_or("at an unknown time")
            )?;
        }

        Ok(())
    }
}

/// Handles the flow of the downloader's commands.
pub struct Program {
    config: AppConfig,
    show_progress: bool,
}

impl Program {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            show_progress: true,
        }
    }

    /// Disable the terminal progress bar.
    pub fn quiet(mut self) -> Self {
        self.show_progress = false;
        self
    }

    /// Copy every file below `source` into the download directory through the buffered writer.
    pub fn import(
        &self,
        source: &Path,
        destination: Option<&Path>,
        memory_index: bool,
    ) -> Result<ImportSummary, Error> {
        if !source.is_dir() {
            bail!("Source directory {} does not exist", source.display());
        }

        let destination = destination
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(&self.config.paths.download_directory));

        let database = if memory_index || !self.config.writer.use_index {
            None
        } else {
            Some(self.open_database()?)
        };

        let filter: Arc<dyn DuplicateFilter> = match &database {
            Some(db) => Arc::new(FileIndex::load(db.clone()).context("Failed to load file index")?),
            None => Arc::new(MemoryFilter::new()),
        };
        let writer = BufferedWriter::new(filter).context("Failed to start buffered writer")?;

        info!("Importing {} into {}", source.display(), destination.display());

        let mut files_queued = 0;
        let mut files_unreadable = 0;
        let mut walk_errors = 0;
        for entry in WalkDir::new(source).sort_by_file_name() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Failed to read directory entry: {}", e);
                    walk_errors += 1;
                    continue;
                }
            };

            if !entry.file_type().is_file() {
                continue;
            }

            let Ok(relative) = entry.path().strip_prefix(source) else {
                continue;
            };

            match fs::read(entry.path()) {
                Ok(data) => {
                    writer.add(destination.join(relative), data)?;
                    files_queued += 1;
                }
                Err(e) => {
                    warn!("Failed to read {}: {}", entry.path().display(), e);
                    files_unreadable += 1;
                }
            }
        }

        info!("Queued {} files for writing", files_queued);
        self.finish_writer(&writer, files_queued)?;

        if let Some(db) = &database {
            db.set_setting(Setting::LastImport, &Utc::now().to_rfc3339())
                .context("Failed to record import time")?;
        }

        let summary = ImportSummary {
            files_queued,
            files_unreadable,
            walk_errors,
            stats: writer.stats(),
        };
        info!(
            saved = summary.stats.bytes_saved,
            discarded = summary.stats.bytes_discarded,
            failed = summary.stats.bytes_failed,
            "Import finished"
        );

        Ok(summary)
    }

    /// Describe the file index, optionally including the record for `lookup`.
    pub fn index_report(&self, lookup: Option<&str>) -> Result<IndexReport, Error> {
        let database = self.open_database()?;
        let index = FileIndex::load(database.clone()).context("Failed to load file index")?;

        let record = match lookup {
            Some(key) => index.lookup(key)?,
            None => None,
        };

        Ok(IndexReport {
            database: PathBuf::from(&self.config.paths.database_file),
            schema_version: database.get_setting(Setting::SchemaVersion)?,
            indexed_files: index.len()?,
            last_import: database.get_setting(Setting::LastImport)?,
            record,
        })
    }

    fn open_database(&self) -> Result<Database, Error> {
        let path = &self.config.paths.database_file;
        Database::open(path).with_context(|| format!("Failed to open database at {}", path))
    }

    /// Shut the writer down while showing its progress.
    ///
    /// Shutdown runs on a scoped thread. The progress bar is polled until that thread returns.
    fn finish_writer(&self, writer: &BufferedWriter, total: u64) -> Result<(), Error> {
        let progress = if self.show_progress {
            ProgressBar::new(total)
        } else {
            ProgressBar::hidden()
        };
        let style = ProgressStyle::with_template("{spinner} [{bar:40}] {pos}/{len} files ({msg})")
            .unwrap_or_else(|_| ProgressStyle::default_bar());
        progress.set_style(style);

        let interval = self.config.writer.progress_interval();
        thread::scope(|scope| {
            let shutdown = scope.spawn(|| self.shutdown_writer(writer));

            while !shutdown.is_finished() {
                let stats = writer.stats();
                progress.set_position(total.saturating_sub(stats.pending_writes as u64));
                progress.set_message(format!("{} saved", format_bytes(stats.bytes_saved)));
                thread::sleep(interval);
            }

            progress.finish_with_message(format!("{} saved", format_bytes(writer.bytes_saved())));
            shutdown
                .join()
                .map_err(|_| anyhow!("Writer shutdown thread panicked"))?
        })
    }

    fn shutdown_writer(&self, writer: &BufferedWriter) -> Result<(), Error> {
        let Some(timeout) = self.config.writer.shutdown_timeout() else {
            return Ok(writer.shutdown()?);
        };

        match writer.shutdown_timeout(timeout) {
            Err(WriterError::ShutdownTimeout { pending, .. }) => {
                warn!("Still flushing {} writes after {:?}, waiting for them", pending, timeout);
                writer.shutdown()?;
            }
            other => other?,
        }

        Ok(())
    }
}

/// Format a byte count for humans.
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};
    use tempfile::{TempDir, tempdir};

    fn test_config(root: &Path) -> AppConfig {
        let mut config = AppConfig::default();
        config.paths.download_directory = root.join("downloads").to_string_lossy().into_owned();
        config.paths.database_file = root.join("data").join("aid.sqlite").to_string_lossy().into_owned();
        config.paths.log_directory = root.join("logs").to_string_lossy().into_owned();
        config.writer.progress_interval_ms = 5;
        config
    }

    fn source_tree() -> TempDir {
        let source = tempdir().unwrap();
        fs::create_dir_all(source.path().join("wolf")).unwrap();
        fs::create_dir_all(source.path().join("fox")).unwrap();
        fs::write(source.path().join("wolf").join("1.jpg"), [1u8; 10]).unwrap();
        fs::write(source.path().join("wolf").join("2.jpg"), [2u8; 20]).unwrap();
        fs::write(source.path().join("fox").join("3.png"), [3u8; 30]).unwrap();
        source
    }

    #[test]
    fn test_import_copies_tree() {
        let root = tempdir().unwrap();
        let source = source_tree();
        let program = Program::new(test_config(root.path())).quiet();

        let summary = program.import(source.path(), None, true).unwrap();

        assert_eq!(summary.files_queued, 3);
        assert_eq!(summary.files_unreadable, 0);
        assert_eq!(summary.walk_errors, 0);
        assert_eq!(summary.stats.bytes_saved, 60);
        assert_eq!(summary.stats.pending_writes, 0);

        let downloads = root.path().join("downloads");
        assert_eq!(fs::read(downloads.join("wolf").join("2.jpg")).unwrap(), [2u8; 20]);
        assert!(downloads.join("fox").join("3.png").exists());
        assert!(!root.path().join("data").join("aid.sqlite").exists());
    }

    #[test]
    fn test_second_import_is_discarded() {
        let root = tempdir().unwrap();
        let source = source_tree();
        let program = Program::new(test_config(root.path())).quiet();

        let first = program.import(source.path(), None, false).unwrap();
        assert_eq!(first.stats.bytes_saved, 60);

        let second = program.import(source.path(), None, false).unwrap();
        assert_eq!(second.stats.bytes_saved, 0);
        assert_eq!(second.stats.bytes_discarded, 60);

        let report = program.index_report(None).unwrap();
        assert_eq!(report.indexed_files, 3);
        assert!(report.last_import.is_some());
        assert_eq!(report.schema_version.as_deref(), Some("2"));
    }

    #[test]
    fn test_import_with_explicit_destination_and_timeout() {
        let root = tempdir().unwrap();
        let source = source_tree();
        let mut config = test_config(root.path());
        config.writer.shutdown_timeout_secs = 5;
        let program = Program::new(config).quiet();

        let target = root.path().join("elsewhere");
        let summary = program.import(source.path(), Some(&target), true).unwrap();

        assert_eq!(summary.stats.files_saved, 3);
        assert!(target.join("wolf").join("1.jpg").exists());
    }

    #[test]
    fn test_index_report_lookup() {
        let root = tempdir().unwrap();
        let source = source_tree();
        let config = test_config(root.path());
        let program = Program::new(config.clone()).quiet();
        program.import(source.path(), None, false).unwrap();

        let key = Path::new(&config.paths.download_directory)
            .join("fox")
            .join("3.png")
            .to_string_lossy()
            .into_owned();
        let report = program.index_report(Some(&key)).unwrap();

        let record = report.record.unwrap();
        assert_eq!(record.size, 30);
        assert!(record.blake3.is_some());
    }

    #[test]
    fn test_missing_source_is_an_error() {
        let root = tempdir().unwrap();
        let program = Program::new(test_config(root.path())).quiet();
        assert!(program.import(&root.path().join("nope"), None, true).is_err());
    }

    /// Filter that stalls on every lookup.
    struct SlowFilter {
        delay: Duration,
    }

    impl DuplicateFilter for SlowFilter {
        fn exists(&self, _key: &str) -> bool {
            thread::sleep(self.delay);
            false
        }
    }

    /// Filter that panics on every lookup.
    struct PanickingFilter;

    impl DuplicateFilter for PanickingFilter {
        fn exists(&self, key: &str) -> bool {
            panic!("lookup of {} exploded", key);
        }
    }

    #[test]
    fn test_finish_writer_honours_timeout_then_drains() {
        let root = tempdir().unwrap();
        let mut config = test_config(root.path());
        config.writer.shutdown_timeout_secs = 1;
        let program = Program::new(config).quiet();

        let writer = BufferedWriter::new(Arc::new(SlowFilter {
            delay: Duration::from_millis(250),
        }))
        .unwrap();
        for i in 0..6 {
            writer.add(root.path().join(format!("out/{}.bin", i)), vec![0u8; 4]).unwrap();
        }

        let started = Instant::now();
        program.finish_writer(&writer, 6).unwrap();

        // Six lookups outlast the one second timeout, and every write still lands.
        assert!(started.elapsed() >= Duration::from_millis(1500));
        let stats = writer.stats();
        assert_eq!(stats.pending_writes, 0);
        assert_eq!(stats.files_saved, 6);
        assert!(!writer.is_accepting());
    }

    #[test]
    fn test_finish_writer_returns_when_filter_panics() {
        let root = tempdir().unwrap();
        let program = Program::new(test_config(root.path())).quiet();

        let writer = BufferedWriter::new(Arc::new(PanickingFilter)).unwrap();
        writer.add(root.path().join("out/a.bin"), vec![1u8; 3]).unwrap();
        writer.add(root.path().join("out/b.bin"), vec![2u8; 4]).unwrap();

        let (done_tx, done_rx) = flume::bounded(1);
        thread::scope(|scope| {
            scope.spawn(|| {
                let result = program.finish_writer(&writer, 2);
                let _ = done_tx.send(result.is_ok());
            });
            assert_eq!(done_rx.recv_timeout(Duration::from_secs(10)), Ok(true));
        });

        let stats = writer.stats();
        assert_eq!(stats.pending_writes, 0);
        assert_eq!(stats.files_failed, 2);
        assert_eq!(stats.bytes_failed, 7);
    }

    #[test]
    fn test_unreadable_and_walk_errors_are_reported_apart() {
        let summary = ImportSummary {
            files_queued: 4,
            files_unreadable: 1,
            walk_errors: 2,
            stats: WriterStats::default(),
        };

        let text = summary.to_string();
        assert!(text.contains("Files unreadable: 1"));
        assert!(text.contains("Walk errors:      2"));
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 bytes");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1024 * 1024), "1.00 MB");
        assert_eq!(format_bytes(1024 * 1024 * 1024), "1.00 GB");
    }
}
