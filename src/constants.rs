//! Application constants for the GHG pre-processor
//!
//! String tags, table file names and default values shared by the
//! parser, inventory, grouping and emission stages.

// =============================================================================
// String Tags
// =============================================================================

/// Sentinel used for missing metadata values so that "absent" is a category
pub const NAN_TAG: &str = "NaN";

/// `data_label` value meaning the data component has no leading label column
pub const DATA_LABEL_NOT_SET: &str = "Not set";

/// `col_N_variable` value marking a column that must not be aggregated
pub const IGNORE_TAG: &str = "ignore";

/// Metadata section holding the description of the data component
pub const FILE_DESCRIPTION_SECTION: &str = "FileDescription";

/// Metadata section for values added by the parser
pub const CUSTOM_SECTION: &str = "Custom";

/// Metadata section listing the instruments
pub const INSTRUMENTS_SECTION: &str = "Instruments";

/// Metadata section with acquisition timing
pub const TIMING_SECTION: &str = "Timing";

/// Separator used when flattening multi-level column keys into table headers
pub const KEY_SEPARATOR: char = '|';

// =============================================================================
// Inventory Flags
// =============================================================================

pub mod flags {
    /// Intrinsic flag for archives that could not be parsed
    pub const PARSE_FAILURE: &str = "Parse failure";

    /// Intrinsic flag for files whose timestamp is off the interval grid
    pub const INCOMPLETE_RECORD: &str = "Incomplete record";

    /// Condition name used when a rule selector matches no data column
    pub const DATA_NOT_AVAILABLE: &str = "Data not available";

    /// Separator between accumulated flags in the inventory table
    pub const SEPARATOR: &str = ",";
}

// =============================================================================
// Persisted Tables
// =============================================================================

pub mod tables {
    pub const FILE_INVENTORY: &str = "file_inventory.csv";
    pub const RAW_DATA_STATISTICS: &str = "raw_data_statistics.csv";
    pub const METADATA_VALUES: &str = "metadata_values.csv";
    pub const CONFIGURATION_GROUPS: &str = "configuration_groups.csv";
    pub const BATCH_MANIFEST: &str = "batches.csv";

    /// Timestamp index column shared by all interval tables
    pub const TIMESTAMP_COLUMN: &str = "TIMESTAMP";
    pub const GROUP_ID_COLUMN: &str = "group_id";

    /// Timestamp format used in every persisted table
    pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
}

// =============================================================================
// Defaults
// =============================================================================

/// Canonical interval length in minutes
pub const DEFAULT_INTERVAL_MINUTES: i64 = 30;

/// Upper bound on files handed to one worker task
pub const MAX_CHUNK_SIZE: usize = 10;

/// Default archive extension for LI-COR style containers
pub const DEFAULT_ARCHIVE_EXTENSION: &str = "ghg";

/// First line written into generated metadata descriptors
pub const METADATA_FILE_HEADER: &str = ";GHG_METADATA";

/// First line written into generated column-mapping and run files
pub const PROCESSING_FILE_HEADER: &str = ";EDDYPRO_PROCESSING";

/// Section of the processing file that holds column assignments
pub const PROJECT_SECTION: &str = "Project";

/// Default number of workers: leave two cores for the system
pub fn default_workers() -> usize {
    num_cpus::get().saturating_sub(2).max(1)
}
