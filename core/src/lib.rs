pub mod companion;
pub mod db;
pub mod docstore;
pub mod error;
pub mod local_store;
pub mod merge;
pub mod models;
pub mod recovery;
pub mod remote;
pub mod service;
pub mod sync;

#[cfg(test)]
mod test_support;
