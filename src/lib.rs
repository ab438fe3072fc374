//! # fxjoin - Federated Join Engine
//!
//! fxjoin answers one request across several independent full-text index
//! cores that share join keys, the way a relational query joins tables.
//! Documents are returned from a single result core; the other cores
//! filter, rank, sort and facet those documents through their keys.
//!
//! ## Architecture
//!
//! The crate is organized into these main modules:
//!
//! - [`index`] - Cores, segments and point-in-time snapshots
//! - [`query`] - Per-core query trees and the composed federated request
//! - [`collector`] - Per-segment collectors (top docs, sort, facets, collapse)
//! - [`join`] - Key bitsets, relational algebra, key caches and score blending
//! - [`search`] - Segment-parallel search coordination
//! - [`federation`] - The multi-phase engine and its response
//! - [`config`] - Engine configuration
//! - [`utils`] - Score encoding and growth helpers
//!
//! ## Quick Start
//!
//! ```ignore
//! use fxjoin::config::EngineConfig;
//! use fxjoin::federation::FederationEngine;
//! use fxjoin::index::{Document, MemoryCore};
//! use fxjoin::query::{ComposedQuery, Query};
//! use std::sync::Arc;
//!
//! let books = MemoryCore::new("books");
//! books.add_segment(vec![Document::new("b1").with_int("author", 7)]);
//! let authors = MemoryCore::new("authors");
//! authors.add_segment(vec![Document::new("a7").with_int("id", 7).with_str("country", "fr")]);
//!
//! let mut engine = FederationEngine::new(EngineConfig::default()).unwrap();
//! engine.register(Arc::new(books)).unwrap();
//! engine.register(Arc::new(authors)).unwrap();
//!
//! // Books whose author is French
//! let request = ComposedQuery::new("books")
//!     .filter("authors", Query::term("country", "fr"))
//!     .join("books", "author", "authors", "id");
//! let response = engine.execute(&request).unwrap();
//! assert_eq!(response.ids(), vec!["b1"]);
//! ```

pub mod collector;
pub mod config;
pub mod error;
pub mod federation;
pub mod index;
pub mod join;
pub mod query;
pub mod search;
pub mod utils;

pub use error::{Error, Result};
