use std::net::IpAddr;

use anyhow::Result;
use async_trait::async_trait;
use castgate_protocol::RemoteControlMode;
use uuid::Uuid;

/// Recorded once per session request, whatever its outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRequestedEvent {
    /// Login name if the requester is authenticated
    pub login: Option<String>,
    pub user_id: Option<String>,
    pub organization_id: Option<String>,
    pub machine_name: String,
    pub requester_name: String,
    pub connection_id: Uuid,
    pub caster_id: Uuid,
    pub mode: RemoteControlMode,
    pub remote_addr: Option<IpAddr>,
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: SessionRequestedEvent) -> Result<()>;
}

/// Writes audit events to the `audit` tracing target.
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, event: SessionRequestedEvent) -> Result<()> {
        tracing::info!(
            target: "audit",
            event = "remote_control_requested",
            login = event.login.as_deref().unwrap_or("-"),
            user_id = event.user_id.as_deref().unwrap_or("-"),
            organization_id = event.organization_id.as_deref().unwrap_or("-"),
            machine_name = %event.machine_name,
            requester_name = %event.requester_name,
            connection_id = %event.connection_id,
            caster_id = %event.caster_id,
            mode = %event.mode,
            remote_addr = ?event.remote_addr,
            "Remote control session requested"
        );
        Ok(())
    }
}
