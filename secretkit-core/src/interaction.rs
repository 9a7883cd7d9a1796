//! The interaction broker: dispatches user prompts to authentication
//! plugins and correlates completions by request id.

use std::sync::{Arc, OnceLock, Weak};

use log::warn;
use tokio::task;

use crate::error::{SecretsError, SecretsResult};
use crate::plugin::AuthenticationPlugin;
use crate::processor::RequestProcessor;
use crate::types::{InteractionParameters, AUTOTEST_PLUGIN_SUFFIX, DEFAULT_AUTHENTICATION_PLUGIN};

/// Dispatches prompt requests to authentication plugins.
///
/// The plugin call blocks until the user answers, so it runs on the
/// worker pool; the completion re-enters the processor through
/// `user_input_interaction_completed`, keyed by the original request id.
pub(crate) struct InteractionBroker {
    autotest_mode: bool,
    processor: OnceLock<Weak<RequestProcessor>>,
}

impl InteractionBroker {
    pub fn new(autotest_mode: bool) -> Self {
        Self {
            autotest_mode,
            processor: OnceLock::new(),
        }
    }

    /// Wires the broker to the processor that owns it.
    pub fn connect(&self, processor: Weak<RequestProcessor>) {
        if self.processor.set(processor).is_err() {
            warn!("interaction broker connected more than once");
        }
    }

    /// Resolves the plugin name a user-input prompt should use: the
    /// requested name, or the configured default (with the autotest
    /// suffix applied) when the request leaves it empty.
    pub fn resolve_user_input_plugin(&self, requested: &str) -> String {
        if !requested.is_empty() {
            return requested.to_string();
        }
        let mut name = DEFAULT_AUTHENTICATION_PLUGIN.to_string();
        if self.autotest_mode {
            name.push_str(AUTOTEST_PLUGIN_SUFFIX);
        }
        name
    }

    /// Dispatches a prompt. The caller has already validated interaction
    /// modes and inserted the pending request; the completion (success,
    /// failure, or cancellation) is delivered asynchronously.
    pub fn begin_user_input(
        &self,
        plugin: Arc<dyn AuthenticationPlugin>,
        caller_pid: u32,
        request_id: u64,
        params: InteractionParameters,
        interaction_service_address: String,
    ) -> SecretsResult<()> {
        let processor = self
            .processor
            .get()
            .cloned()
            .ok_or_else(|| SecretsError::unknown("interaction broker is not connected"))?;
        tokio::spawn(async move {
            let result = task::spawn_blocking(move || {
                plugin.begin_user_input_interaction(
                    caller_pid,
                    request_id,
                    &params,
                    &interaction_service_address,
                )
            })
            .await
            .unwrap_or_else(|e| {
                Err(SecretsError::unknown(format!(
                    "interaction worker failed: {e}"
                )))
            });
            if let Some(processor) = processor.upgrade() {
                processor
                    .user_input_interaction_completed(caller_pid, request_id, result)
                    .await;
            }
        });
        Ok(())
    }
}
