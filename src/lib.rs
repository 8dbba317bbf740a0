//! # ragserve
//!
//! **A locally-deployed Retrieval-Augmented Generation service.**
//!
//! ragserve ingests user documents, chunks them with language-aware
//! splitting, embeds them through an external embedding service, and stores
//! the vectors in per-knowledge-base collections of an external vector
//! store. Questions are answered by an LLM tool-calling loop that retrieves
//! snippets on demand and synthesizes a grounded answer.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────┐   ┌─────────────┐   ┌──────────────┐
//! │ Loaders  │──▶│   Chunker    │──▶│  Embedder   │──▶│ Vector store │
//! │ txt/md/  │   │ (Chinese-    │   │ (batched +  │   │ (collection  │
//! │ pdf/docx │   │  aware)      │   │  retried)   │   │  per KB)     │
//! └──────────┘   └──────────────┘   └─────────────┘   └──────┬───────┘
//!                                                           │
//!      ┌──────────┐   ┌───────────┐   ┌────────────────┐    │
//!      │ HTTP API │◀──│   Agent   │◀──│ Retrieval      │◀───┘
//!      │ (axum)   │   │ tool loop │   │ vector/keyword │
//!      └──────────┘   └───────────┘   │ hybrid/adaptive│
//!                                     └────────────────┘
//! ```
//!
//! ## Data flow
//!
//! 1. **Ingestion** — file → [`loader`] → documents → [`chunker`] → chunks
//!    → [`embedding`] (batched) → [`vectorstore`] (batched upsert) →
//!    [`metadata`] status update. Orchestrated by [`ingest`], isolated per
//!    file.
//! 2. **Query** — query → [`agent`] → LLM plans → optionally calls the
//!    retrieval tool → [`retrieval`] searches the KB → snippets back to the
//!    LLM → synthesized answer. Every step lands in the [`flowlog`].
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and startup validation |
//! | [`error`] | Domain error kinds and the crate `Result` alias |
//! | [`models`] | Core data types: documents, chunks, KBs, files, hits |
//! | [`loader`] | Extension-dispatched document loaders |
//! | [`chunker`] | Recursive, language-aware text chunker |
//! | [`embedding`] | Embedding client with batching, retry, and backoff |
//! | [`vectorstore`] | Vector store trait, REST client, in-memory store |
//! | [`metadata`] | SQLite-backed KB and file records (pool + migrations) |
//! | [`ingest`] | Ingestion pipeline with partial-failure reporting |
//! | [`kb`] | Knowledge-base manager: lifecycle, uploads, query dispatch |
//! | [`retrieval`] | Vector, keyword, hybrid, and adaptive search |
//! | [`llm`] | Provider-agnostic chat types and the LLM client |
//! | [`agent`] | LLM tool-calling orchestrator |
//! | [`flowlog`] | Session-correlated flow log and analyzer |
//! | [`server`] | HTTP API (axum) |

pub mod agent;
pub mod chunker;
pub mod config;
pub mod embedding;
pub mod error;
pub mod flowlog;
pub mod ingest;
pub mod kb;
pub mod llm;
pub mod loader;
pub mod metadata;
pub mod models;
pub mod retrieval;
pub mod server;
pub mod vectorstore;
