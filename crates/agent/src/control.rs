//! Message-bus control plane: start and stop commands arriving as JSON.

use std::sync::Arc;

use sandgate_core::error::Result;
use sandgate_core::limits::TaskLimits;
use sandgate_core::messages::{StartMessage, StopMessage, START_SUBJECT, STOP_SUBJECT};
use sandgate_core::traits::MessageBus;

use crate::agent::AgentHandle;

/// Subscribe to the start and stop subjects and forward commands into the
/// agent control loop. Returns once both subscriptions are established.
pub async fn subscribe_control(handle: AgentHandle, bus: Arc<dyn MessageBus>) -> Result<()> {
    let mut starts = bus.subscribe(START_SUBJECT).await?;
    let mut stops = bus.subscribe(STOP_SUBJECT).await?;

    let start_handle = handle.clone();
    tokio::spawn(async move {
        while let Some(payload) = starts.recv().await {
            handle_start(&start_handle, &payload).await;
        }
        tracing::warn!(subject = START_SUBJECT, "control subscription closed");
    });

    tokio::spawn(async move {
        while let Some(payload) = stops.recv().await {
            handle_stop(&handle, &payload).await;
        }
        tracing::warn!(subject = STOP_SUBJECT, "control subscription closed");
    });

    Ok(())
}

async fn handle_start(handle: &AgentHandle, payload: &[u8]) {
    let message: StartMessage = match serde_json::from_slice(payload) {
        Ok(message) => message,
        Err(e) => {
            tracing::warn!(error = %e, "dropping malformed start message");
            return;
        }
    };

    let limits = match TaskLimits::from_megabytes(message.memory_limit, message.disk_limit) {
        Ok(limits) => limits,
        Err(e) => {
            tracing::warn!(task = %message.task, error = %e, "dropping start with invalid limits");
            return;
        }
    };
    if let Err(e) = handle
        .start_task(
            message.task.clone(),
            message.secure_token,
            limits,
            message.public_key,
        )
        .await
    {
        tracing::warn!(task = %message.task, error = %e, "start command failed");
    }
}

async fn handle_stop(handle: &AgentHandle, payload: &[u8]) {
    let message: StopMessage = match serde_json::from_slice(payload) {
        Ok(message) => message,
        Err(e) => {
            tracing::warn!(error = %e, "dropping malformed stop message");
            return;
        }
    };

    if let Err(e) = handle.stop_task(message.task.clone()).await {
        tracing::warn!(task = %message.task, error = %e, "stop command failed");
    }
}
