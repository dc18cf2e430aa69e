pub mod checksum;
pub mod config;
pub mod control;
pub mod engine;
pub mod errors;
pub mod fetch_head;
pub mod logging;
pub mod net;
pub mod observer;
pub mod part_worker;
pub mod record;
pub mod retry;
pub mod scheduler;
pub mod segmenter;
pub mod snapshot;
pub mod storage;
pub mod url_model;
