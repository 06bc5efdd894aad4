/// Column names of the title basics dump (`title.basics.tsv`)
pub const COL_TCONST: &str = "tconst";
pub const COL_TITLE_TYPE: &str = "titleType";
pub const COL_PRIMARY_TITLE: &str = "primaryTitle";
pub const COL_ORIGINAL_TITLE: &str = "originalTitle";
pub const COL_IS_ADULT: &str = "isAdult";
pub const COL_START_YEAR: &str = "startYear";
pub const COL_RUNTIME_MINUTES: &str = "runtimeMinutes";
pub const COL_GENRES: &str = "genres";

/// Column names of the ratings dump (`title.ratings.tsv`)
pub const COL_AVERAGE_RATING: &str = "averageRating";
pub const COL_NUM_VOTES: &str = "numVotes";

pub const BASICS_COLUMNS: &[&str] = &[
    COL_TCONST,
    COL_TITLE_TYPE,
    COL_PRIMARY_TITLE,
    COL_IS_ADULT,
    COL_START_YEAR,
    COL_RUNTIME_MINUTES,
    COL_GENRES,
];
pub const RATINGS_COLUMNS: &[&str] = &[COL_TCONST, COL_AVERAGE_RATING, COL_NUM_VOTES];

// Source framing
pub const FIELD_DELIMITER: char = '\t';
pub const NULL_SENTINEL: &str = "\\N";
pub const GZIP_SUFFIX: &str = ".gz";

// Inclusion filters
pub const TARGET_TITLE_TYPE: &str = "movie";
pub const RESTRICTED_FLAG: &str = "1";

/// OMDb marks unknown values with this literal
pub const OMDB_PLACEHOLDER: &str = "N/A";
pub const DEFAULT_OMDB_BASE_URL: &str = "https://www.omdbapi.com/";

// Public dataset host used by `import --remote`
pub const DEFAULT_DATASET_BASE_URL: &str = "https://datasets.imdbws.com/";
pub const BASICS_DATASET_FILE: &str = "title.basics.tsv.gz";
pub const RATINGS_DATASET_FILE: &str = "title.ratings.tsv.gz";
/// Request timeout for a whole dataset download
pub const DATASET_DOWNLOAD_TIMEOUT_SECS: u64 = 1800;

// Document field names in the record store
pub const FIELD_EXTERNAL_ID: &str = "imdbId";
pub const FIELD_NAME: &str = "name";
pub const FIELD_DESCRIPTION: &str = "description";
pub const FIELD_RATING: &str = "rating";
pub const FIELD_NUM_VOTES: &str = "numVotes";
pub const FIELD_RELEASE_DATE: &str = "releaseDate";
pub const FIELD_DURATION: &str = "duration";
pub const FIELD_DIRECTOR: &str = "director";
pub const FIELD_GENRES: &str = "genres";
pub const FIELD_POSTER_URL: &str = "posterUrl";

// Environment variables
pub const ENV_DATABASE: &str = "CINEPHILE_DATABASE";
pub const ENV_OMDB_API_KEY: &str = "OMDB_API_KEY";
pub const ENV_QUEUE_DB: &str = "CINEPHILE_QUEUE_DB";
pub const ENV_CONFIG: &str = "CINEPHILE_CONFIG";
pub const ENV_METRICS_PORT: &str = "CINEPHILE_METRICS_PORT";
pub const ENV_LOG_DIR: &str = "CINEPHILE_LOG_DIR";

pub const DEFAULT_DATABASE_PATH: &str = "data/cinephile.db";
pub const DEFAULT_CONFIG_PATH: &str = "cinephile.toml";
pub const DEFAULT_LOG_DIR: &str = "logs";
/// Persistence target that selects the in-process record store
pub const MEMORY_DATABASE: &str = "memory";
/// How long a SQLite connection waits on another process's write lock
pub const SQLITE_BUSY_TIMEOUT_MS: u64 = 5_000;

// Import defaults
pub const DEFAULT_TOP_N: usize = 250;
pub const DEFAULT_MIN_VOTES: u64 = 50_000;

/// Enrichment progress is logged every this many finished lookups
pub const ENRICH_PROGRESS_EVERY: usize = 25;

/// Prefix of ids handed out by the in-process queue
pub const EPHEMERAL_JOB_PREFIX: &str = "mem-";
