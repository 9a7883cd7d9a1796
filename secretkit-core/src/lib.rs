//! secretkit-core — the secrets daemon core.
//!
//! This crate implements a process-local security daemon that mediates
//! all access to persistent secret material (passwords, tokens,
//! certificates, keys) for client applications. Clients never see
//! ciphertext or storage layout; when a hardware-backed plugin is in
//! use they never see cleartext key material either.
//!
//! # Architecture
//!
//! The daemon owns a bookkeeping database (`secretkit-db`) recording
//! metadata for every secret and collection, and delegates bulk storage
//! and crypto to extension plugins of four kinds: storage, encryption,
//! combined encrypted-storage, and authentication (user prompting).
//!
//! The centre of the crate is the [`RequestProcessor`]: it validates
//! every request against metadata and access-control policy, drives the
//! multi-step asynchronous protocol between bookkeeping, key derivation,
//! user prompting and plugin I/O, and manages the in-memory unlock state
//! (derived keys, relock timers, interleave guards) across interleaved
//! requests.
//!
//! Blocking plugin and KDF work runs on the tokio blocking pool; user
//! prompts suspend the request into a pending table and complete later
//! through the interaction broker, delivering the terminal result on the
//! processor's finished channel.
//!
//! # Embedding
//!
//! The IPC transport is out of scope: an embedding daemon receives
//! client calls on its own transport, invokes the processor's async
//! operations with a caller pid and a unique request id, and forwards
//! [`RequestFinished`] notifications for requests that went
//! [`Outcome::Pending`].

mod cache;
mod error;
mod guard;
mod interaction;
mod key;
mod lock_state;
mod pending;
mod permissions;
pub mod plugin;
mod processor;
mod types;

pub use error::{SecretsError, SecretsResult};
pub use key::DerivedKey;
pub use lock_state::LockState;
pub use permissions::{ApplicationPermissions, StaticApplicationPermissions};
pub use processor::RequestProcessor;
pub use types::{
    hashed_secret_name, is_reserved_collection_name, AccessControlMode, CollectionMetadata,
    EchoMode, FilterData, FilterOperator, InputType, InteractionOperation, InteractionParameters,
    LockCodeTarget, Outcome, PluginInfo, PluginInfoReport, Reply, RequestFinished, Secret,
    SecretEnvelope, SecretIdentifier, SecretMetadata, UnlockSemantic, UserInteractionMode,
    AUTOTEST_PLUGIN_SUFFIX, DEFAULT_AUTHENTICATION_PLUGIN, RESERVED_COLLECTION_NAME,
};
