//! Module related to handling and processing the logs produced by the engine.

// Lint options for this module
#![deny(
    missing_docs,
    trivial_casts,
    trivial_numeric_casts,
    unsafe_code,
    unstable_features,
    unused_import_braces,
    unused_qualifications
)]

use crate::AodvError;
use slog::{Drain, Logger};
use std::fs::{File, OpenOptions};
use std::io;
use std::io::BufRead;
use std::path::Path;

/// Directory name for where the logs will be placed.
pub const LOG_DIR_NAME: &str = "log";
const LOG_CHANNEL_SIZE: usize = 512; //Default is 128
const LOG_THREAD_NAME: &str = "LoggerThread";

/// Struct that encapsulates a log entry
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LogEntry {
    /// Main log message
    pub msg: String,
    /// Logging level
    pub level: String,
    /// Timestamp of the event
    pub ts: String,
    /// Type of control message, if the record concerns one
    pub msg_type: Option<String>,
    /// Destination the operation is about
    pub msg_destination: Option<String>,
    /// Originator of the control message
    pub msg_originator: Option<String>,
    /// Flood identifier of an RREQ
    pub flooding_id: Option<u32>,
    /// Hop count carried by the message
    pub hop_count: Option<u8>,
    /// Reason a packet was dropped
    pub reason: Option<String>,
}

///Loads a log file and produces an array of log records for processing.
pub fn get_log_records_from_file<P: AsRef<Path>>(path: P) -> Result<Vec<LogEntry>, io::Error> {
    let file = File::open(path)?;
    let mut records = Vec::new();
    let reader = io::BufReader::new(file);

    for line in reader.lines() {
        let data = line?;
        let u: LogEntry = serde_json::from_str(&data)?;
        records.push(u);
    }

    Ok(records)
}

///Given a message, returns the first log record that matches it.
pub fn find_record_by_msg<'a>(msg: &str, records: &'a [LogEntry]) -> Option<&'a LogEntry> {
    for rec in records {
        if &rec.msg == &msg {
            return Some(rec);
        }
    }
    None
}

/// Create a duplicate logger for the terminal and the file passed as parameter.
pub fn create_logger<P: AsRef<Path>>(
    log_file_name: P,
    log_term: bool,
) -> Result<Logger, AodvError> {
    //Make sure the full path is valid
    if let Some(parent) = log_file_name.as_ref().parent() {
        std::fs::create_dir_all(parent)?;
    }

    let log_file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(log_file_name)?;

    if log_term {
        create_term_and_file_logger(log_file)
    } else {
        create_file_logger(log_file)
    }
}

fn create_file_logger(log_file: File) -> Result<Logger, AodvError> {
    let d2 = slog_json::Json::new(log_file)
        .add_default_keys()
        .build()
        .fuse();
    let d2 = slog_async::Async::new(d2)
        .chan_size(LOG_CHANNEL_SIZE)
        .overflow_strategy(slog_async::OverflowStrategy::Drop)
        .thread_name(format!("File{}", LOG_THREAD_NAME))
        .build()
        .fuse();

    let logger = Logger::root(d2, o!());

    Ok(logger)
}

fn create_term_and_file_logger(log_file: File) -> Result<Logger, AodvError> {
    //Create the terminal drain
    let decorator = slog_term::TermDecorator::new().build();
    let d1 = slog_term::CompactFormat::new(decorator).build().fuse();
    let d1 = slog_async::Async::new(d1)
        .chan_size(LOG_CHANNEL_SIZE)
        .overflow_strategy(slog_async::OverflowStrategy::Drop)
        .thread_name(format!("Term{}", LOG_THREAD_NAME))
        .build()
        .fuse();

    //Create the file drain
    let d2 = slog_json::Json::new(log_file)
        .add_default_keys()
        .build()
        .fuse();
    let d2 = slog_async::Async::new(d2)
        .chan_size(LOG_CHANNEL_SIZE)
        .overflow_strategy(slog_async::OverflowStrategy::Drop)
        .thread_name(format!("File{}", LOG_THREAD_NAME))
        .build()
        .fuse();

    //Fuse the drains and create the logger
    let logger = Logger::root(slog::Duplicate::new(d1, d2).fuse(), o!());

    Ok(logger)
}

/// Creates a logger that discards all records. Used for tests that don't need logs.
pub fn create_discard_logger() -> Logger {
    Logger::root(slog::Discard, o!())
}
