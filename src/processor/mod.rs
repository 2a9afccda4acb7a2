//! Pre-processing pipeline.
//!
//! Orchestrates one site run: inventory scan, parsing of pending
//! archives on the worker pool, grouping, filtering, batching and
//! descriptor emission. Only this module touches the on-disk tables.

pub mod workers;

#[cfg(test)]
pub mod tests;

use colored::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::archive::ArchiveParser;
use crate::batch::BatchPartitioner;
use crate::config::ProcessingConfig;
use crate::descriptor::DescriptorEmitter;
use crate::error::{GhgError, Result};
use crate::filter::FilterEngine;
use crate::grouping::Grouper;
use crate::ini::IniDocument;
use crate::inventory::{DiscoveredFile, InventoryBuilder};
use crate::models::{DateRange, ProcessingStats, RecordStatus};
use crate::store::InventoryStore;

/// Runs the pipeline for one configured site
#[derive(Debug, Clone)]
pub struct GhgProcessor {
    config: Arc<ProcessingConfig>,
    metadata_dir: PathBuf,
    output_dir: PathBuf,
}

impl GhgProcessor {
    /// Validate the configuration and resolve the working directories
    pub fn new(config: ProcessingConfig) -> Result<Self> {
        config.validate()?;
        if config.paths.source_dirs.is_empty() {
            return Err(GhgError::configuration("paths.source_dirs is empty"));
        }
        let metadata_dir = config.metadata_dir()?.to_path_buf();
        let output_dir = config.output_dir()?.to_path_buf();
        Ok(Self {
            config: Arc::new(config),
            metadata_dir,
            output_dir,
        })
    }

    pub fn config(&self) -> &ProcessingConfig {
        &self.config
    }

    pub fn metadata_dir(&self) -> &Path {
        &self.metadata_dir
    }

    /// Remove the metadata and output directories of the site
    pub async fn reset(&self) -> Result<()> {
        for dir in [&self.metadata_dir, &self.output_dir] {
            if fs::try_exists(dir).await? {
                fs::remove_dir_all(dir).await?;
                info!("Removed {}", dir.display());
            }
        }
        Ok(())
    }

    /// Build or extend the inventory without parsing
    pub async fn scan(&self) -> Result<ProcessingStats> {
        let start_time = Instant::now();
        self.print_banner("Scanning GHG archives");

        let mut store = InventoryStore::open(&self.metadata_dir)?;
        let mut stats = ProcessingStats::default();
        self.build_inventory(&mut store, &mut stats).await?;
        store.save()?;

        stats.processing_time_ms = start_time.elapsed().as_millis();
        self.print_summary(&stats);
        Ok(stats)
    }

    /// Full run
    pub async fn process(&self) -> Result<ProcessingStats> {
        let start_time = Instant::now();
        self.print_banner("Starting GHG pre-processing");

        let mut store = InventoryStore::open(&self.metadata_dir)?;
        let mut stats = ProcessingStats::default();

        self.build_inventory(&mut store, &mut stats).await?;
        self.parse_pending(&mut store, &mut stats).await?;
        store.save()?;

        self.group_and_filter(&mut store, &mut stats)?;
        self.emit(&store, &mut stats)?;
        store.save()?;

        stats.processing_time_ms = start_time.elapsed().as_millis();
        self.print_summary(&stats);
        Ok(stats)
    }

    async fn build_inventory(
        &self,
        store: &mut InventoryStore,
        stats: &mut ProcessingStats,
    ) -> Result<()> {
        println!("\n{}", "Scanning source directories...".bright_yellow());
        let builder = Arc::new(InventoryBuilder::new(&self.config)?);
        let candidates = builder.candidates(&self.config.paths.source_dirs)?;
        debug!("{} candidate files", candidates.len());

        let known = Arc::new(store.known_names());
        let results = workers::run_chunked(
            candidates,
            self.config.workers,
            "Scanning files",
            move |path| builder.inspect(&path, &known),
        )
        .await;

        let mut found: Vec<DiscoveredFile> = Vec::new();
        for result in results {
            match result {
                Ok(Some(file)) => found.push(file),
                Ok(None) => {}
                Err(e) => warn!("Skipping file: {}", e),
            }
        }
        stats.files_discovered = found.len();
        stats.files_copied = found.iter().filter(|f| f.copied).count();

        let outcome = store.merge_discovered(found, self.config.interval());
        let range = self.config.date_range()?;
        let in_range = store
            .records()
            .values()
            .any(|r| r.status != RecordStatus::Gap && range.contains(&r.timestamp));
        if !in_range {
            let dirs: Vec<String> = self
                .config
                .paths
                .source_dirs
                .iter()
                .map(|d| d.display().to_string())
                .collect();
            return Err(GhgError::NoSourceFiles {
                context: format!(" in {}{}", dirs.join(", "), describe_range(&range)),
            });
        }

        println!(
            "  {} {} new files ({} copied), {} gaps, {} duplicates",
            "Found".bright_green(),
            outcome.added.to_string().bright_white().bold(),
            stats.files_copied,
            outcome.gaps,
            outcome.duplicates
        );
        if outcome.incomplete > 0 {
            warn!("{} files are off the interval grid", outcome.incomplete);
        }
        Ok(())
    }

    async fn parse_pending(
        &self,
        store: &mut InventoryStore,
        stats: &mut ProcessingStats,
    ) -> Result<()> {
        let pending = store.pending();
        if pending.is_empty() {
            println!("\n{}", "No pending archives".bright_yellow());
            return Ok(());
        }

        println!(
            "\n{} {}",
            "Parsing archives:".bright_yellow(),
            pending.len().to_string().bright_white().bold()
        );
        let parser = Arc::new(ArchiveParser::new(&self.config)?);
        let results = workers::run_chunked(
            pending,
            self.config.workers,
            "Parsing archives",
            move |(timestamp, path)| {
                let result = parser.parse(&path, timestamp);
                (timestamp, path, result)
            },
        )
        .await;

        for (timestamp, path, result) in results {
            match &result {
                Ok(_) => stats.files_parsed += 1,
                Err(e) => {
                    warn!("Failed to parse {}: {}", path.display(), e);
                    stats.files_failed += 1;
                }
            }
            store.record_parse(timestamp, result);
        }
        Ok(())
    }

    fn group_and_filter(
        &self,
        store: &mut InventoryStore,
        stats: &mut ProcessingStats,
    ) -> Result<()> {
        println!("\n{}", "Grouping configurations...".bright_yellow());
        let grouper = Grouper::new(&self.config)?;
        let outcome = grouper.group(store.metadata());
        store.apply_grouping(&outcome);
        stats.groups = outcome.groups.len();
        for group in &outcome.groups {
            println!(
                "  {} {}: {} intervals",
                "Group".bright_cyan(),
                group.group_id,
                group.member_count
            );
        }

        let engine = FilterEngine::new(&self.config);
        let range = self.config.date_range()?;
        let flags = engine.apply(
            store.groups(),
            store.statistics(),
            store.metadata_groups(),
            &range,
        );
        stats.intervals_flagged = store.apply_flags(&flags);
        info!(
            "{} filter rules flagged {} intervals",
            engine.rule_count(),
            stats.intervals_flagged
        );
        Ok(())
    }

    fn emit(&self, store: &InventoryStore, stats: &mut ProcessingStats) -> Result<()> {
        println!("\n{}", "Preparing batches...".bright_yellow());
        let static_settings = self
            .config
            .batching
            .static_settings_template
            .as_deref()
            .map(IniDocument::read)
            .transpose()?;
        let partitioner =
            BatchPartitioner::new(&self.config, static_settings.as_ref(), &self.output_dir);
        let emitter = DescriptorEmitter::new(&self.config, static_settings, &self.metadata_dir)?;
        let range = self.config.date_range()?;

        let mut all_batches = Vec::new();
        for group in store.groups() {
            let descriptors = emitter.emit_group(group)?;
            stats.descriptors_written += 2;

            let eligible = store.eligible(group.group_id, &range);
            let batches = partitioner.partition(group.group_id, &eligible);
            if batches.is_empty() {
                info!("Group {} has no eligible intervals", group.group_id);
                continue;
            }
            if let Some(batch) = batches.first() {
                std::fs::create_dir_all(&batch.merge_dir)?;
            }
            emitter.emit_batches(group, &descriptors, &batches)?;
            println!(
                "  {} {}: {} eligible intervals in {} batches",
                "Group".bright_cyan(),
                group.group_id,
                eligible.len(),
                batches.len()
            );
            all_batches.extend(batches);
        }

        emitter.write_manifest(&all_batches, store.records())?;
        stats.batches = all_batches.len();
        Ok(())
    }

    fn print_banner(&self, title: &str) {
        println!("{}", title.bright_green().bold());
        println!("  {} {}", "Site:".bright_cyan(), self.config.site_id);
        for dir in &self.config.paths.source_dirs {
            println!("  {} {}", "Source:".bright_cyan(), dir.display());
        }
        println!(
            "  {} {}",
            "Metadata:".bright_cyan(),
            self.metadata_dir.display()
        );
        println!(
            "  {} {}",
            "Output:".bright_cyan(),
            self.output_dir.display()
        );
    }

    fn print_summary(&self, stats: &ProcessingStats) {
        println!("\n{}", "Processing Summary".bright_green().bold());
        println!(
            "  {} {}ms",
            "Time elapsed:".bright_cyan(),
            stats.processing_time_ms.to_string().bright_white()
        );
        println!(
            "  {} {}",
            "Files discovered:".bright_cyan(),
            stats.files_discovered.to_string().bright_white()
        );
        println!(
            "  {} {}",
            "Files parsed:".bright_cyan(),
            stats.files_parsed.to_string().bright_white()
        );
        if stats.files_failed > 0 {
            println!(
                "  {} {}",
                "Files failed:".bright_red(),
                stats.files_failed.to_string().bright_red().bold()
            );
        }
        println!(
            "  {} {}",
            "Groups:".bright_cyan(),
            stats.groups.to_string().bright_white().bold()
        );
        println!(
            "  {} {}",
            "Intervals flagged:".bright_cyan(),
            stats.intervals_flagged.to_string().bright_white()
        );
        println!(
            "  {} {}",
            "Batches:".bright_cyan(),
            stats.batches.to_string().bright_white().bold()
        );
    }
}

fn describe_range(range: &DateRange) -> String {
    match (range.start, range.end) {
        (None, None) => String::new(),
        (start, end) => format!(
            " between {} and {}",
            start.map_or_else(|| "the first file".to_string(), |t| t.to_string()),
            end.map_or_else(|| "the last file".to_string(), |t| t.to_string())
        ),
    }
}
