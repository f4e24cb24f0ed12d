//! Inbound message fan-out: message stats and the tenant's webhook.

use std::sync::Arc;

use {
    tracing::{debug, warn},
    wagate_protocol::InboundMessage,
};

use crate::{
    manager::Inner,
    model::SessionStatus,
    registry::SessionEntry,
    telemetry,
    webhook::{WebhookMessage, WebhookPayload},
};

/// Route one inbound message. Side effects run on their own tasks so a slow
/// endpoint never holds up the session's event loop.
pub(crate) fn route_inbound(inner: &Arc<Inner>, entry: &Arc<SessionEntry>, message: InboundMessage) {
    let status = entry.status();
    if status != SessionStatus::Connected {
        debug!(session_id = %entry.id, %status, "dropping inbound message");
        return;
    }
    if message.from_me {
        return;
    }

    entry.touch();
    telemetry::message_received();
    let sender = message.from.canonical();
    debug!(session_id = %entry.id, sender = %sender, kind = %message.kind, "inbound message");

    if let (Some(owner), Some(instance)) = (entry.owner_id.clone(), entry.instance_key.clone()) {
        let stats = Arc::clone(&inner.stats);
        let session_id = entry.id.clone();
        inner.tracker.spawn(async move {
            if let Err(e) = stats.record_received(&owner, &instance).await {
                warn!(session_id = %session_id, error = %e, "failed to record received message");
            }
        });
    }

    let Some(target) = entry.webhook_target.clone() else {
        debug!(session_id = %entry.id, "no webhook target, not forwarding");
        return;
    };
    let payload = WebhookPayload {
        session_id: entry.id.clone(),
        sender_address: sender.to_string(),
        message: WebhookMessage {
            id: message.id,
            timestamp: message.timestamp,
            text: message.text,
            kind: message.kind,
        },
    };
    let webhooks = Arc::clone(&inner.webhooks);
    inner.tracker.spawn(async move {
        if let Err(e) = webhooks.dispatch(&target, &payload).await {
            telemetry::webhook_failed();
            warn!(session_id = %payload.session_id, error = %e, "webhook delivery failed");
        }
    });
}
