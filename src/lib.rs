//! # Knowledge Harness
//!
//! Ingestion pipeline and hybrid retrieval engine for a personal knowledge
//! store.
//!
//! Uploads are fingerprinted and deduplicated, stored, and queued. A
//! rate-limited worker pool extracts text, classifies it (title, summary,
//! category, tags), commits the metadata together with a full-text mirror
//! row, and then replaces the file's chunk vectors. Search runs keyword and
//! vector queries concurrently and fuses them into one ranking.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────────┐   ┌─────────────────────────────┐
//! │  ingest  │──▶│ scheduler │──▶│ pipeline                    │
//! │ hash+dup │   │ N workers │   │ extract → classify → commit │
//! └──────────┘   │ rate-limit│   │ → chunk → embed → vectors   │
//!                └───────────┘   └──────┬───────────────┬──────┘
//!                                       ▼               ▼
//!                              ┌─────────────────┐ ┌──────────┐
//!                              │ SQLite + FTS5   │ │  vector  │
//!                              │ records, mirror │ │  index   │
//!                              └────────┬────────┘ └────┬─────┘
//!                                       └──────┬────────┘
//!                                              ▼
//!                                      ┌──────────────┐
//!                                      │ hybrid search│
//!                                      └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! kh init                       # create database and storage
//! kh add ~/Documents/papers     # upload and process
//! kh search "attention heads"   # hybrid search
//! kh serve                      # start HTTP API
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`fingerprint`] | Content hashing for dedup |
//! | [`store`] | Record store and status transitions |
//! | [`lexical`] | FTS5 mirror and keyword search |
//! | [`chunk`] | Word-window chunking |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`vector`] | Vector index backends (SQLite, Qdrant) |
//! | [`index_sync`] | Per-file vector replacement |
//! | [`extract`] | Extraction dispatch by file type |
//! | [`classify`] | Metadata classification |
//! | [`scheduler`] | Rate-limited ingestion worker pool |
//! | [`pipeline`] | Per-file processing |
//! | [`ingest`] | Upload staging and dedup |
//! | [`search`] | Hybrid retrieval |
//! | [`jobs`] | Recovery and reindex |
//! | [`harness`] | Service handle |
//! | [`server`] | HTTP API |

pub mod chunk;
pub mod classify;
pub mod config;
pub mod db;
pub mod embedding;
pub mod extract;
pub mod fingerprint;
pub mod harness;
pub mod index_sync;
pub mod ingest;
pub mod jobs;
pub mod lexical;
pub mod migrate;
pub mod models;
pub mod pipeline;
pub mod scheduler;
pub mod search;
pub mod server;
pub mod store;
pub mod vector;
