//! Viewer-side session broker.
//!
//! A viewer connection moves through
//! `Idle -> (AwaitingDevice) -> Requesting -> Active | Unauthorized | Rejected`
//! and finally `Closed`. Each transition is a method on [`Broker`]; the
//! per-connection state lives in [`ViewerContext`], owned by the
//! connection's task.

use std::net::IpAddr;
use std::ops::ControlFlow;
use std::sync::Arc;

use castgate_protocol::{
    AgentMessage, CasterMessage, RemoteControlConfig, RemoteControlMode, ViewerMessage,
    ViewerRequest,
};
use uuid::Uuid;

use crate::access::{AccessProvider, UserRecord};
use crate::audit::{AuditSink, SessionRequestedEvent};
use crate::authz::{Authorization, AuthorizationGate};
use crate::directory::{SessionDirectory, SessionHandle};
use crate::hub::ConnectionHub;
use crate::limiter::ConcurrencyLimiter;
use crate::prejoin::PrejoinQueue;

const SESSION_LIMIT_MESSAGE: &str = "Max number of concurrent sessions reached.";
const SESSION_LIMIT_CLOSE_REASON: &str = "session limit reached";

/// Who is on the other end of a viewer connection.
#[derive(Debug, Clone, Default)]
pub struct Requester {
    /// Set when the connection presented a valid token
    pub user_id: Option<String>,
    pub remote_addr: Option<IpAddr>,
}

impl Requester {
    #[cfg(test)]
    pub fn anonymous() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn authenticated(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            remote_addr: None,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.user_id.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewerState {
    Idle,
    AwaitingDevice,
    Requesting,
    Active,
    Unauthorized,
    Rejected,
    Closed,
}

/// The caster a viewer is paired with. Set once, on activation.
#[derive(Debug, Clone)]
struct Pairing {
    caster_id: Uuid,
    session: SessionHandle,
}

#[derive(Debug, Clone)]
struct PrejoinWait {
    token: Uuid,
    device_id: String,
}

/// State of one viewer connection.
#[derive(Debug)]
pub struct ViewerContext {
    connection_id: Uuid,
    requester: Requester,
    state: ViewerState,
    mode: RemoteControlMode,
    requester_name: String,
    pairing: Option<Pairing>,
    prejoin: Option<PrejoinWait>,
    otp: Option<String>,
}

impl ViewerContext {
    pub fn new(connection_id: Uuid, requester: Requester) -> Self {
        Self {
            connection_id,
            requester,
            state: ViewerState::Idle,
            mode: RemoteControlMode::Normal,
            requester_name: String::new(),
            pairing: None,
            prejoin: None,
            otp: None,
        }
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    pub fn requester(&self) -> &Requester {
        &self.requester
    }

    #[cfg(test)]
    pub fn state(&self) -> ViewerState {
        self.state
    }

    #[cfg(test)]
    pub fn mode(&self) -> RemoteControlMode {
        self.mode
    }

    #[cfg(test)]
    pub fn requester_name(&self) -> &str {
        &self.requester_name
    }

    pub fn caster_id(&self) -> Option<Uuid> {
        self.pairing.as_ref().map(|p| p.caster_id)
    }

    pub fn session(&self) -> Option<&SessionHandle> {
        self.pairing.as_ref().map(|p| &p.session)
    }

    #[cfg(test)]
    pub fn prejoin_token(&self) -> Option<Uuid> {
        self.prejoin.as_ref().map(|w| w.token)
    }

    #[cfg(test)]
    pub fn otp(&self) -> Option<&str> {
        self.otp.as_deref()
    }
}

/// A viewer's request for a screen cast.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub target: String,
    pub requester_name: String,
    pub mode: RemoteControlMode,
    pub otp: Option<String>,
}

/// How an accepted session request proceeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The caster asks the person at the device
    Requested,
    /// The caster starts casting without asking
    Granted,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("empty target")]
    EmptyTarget,
    #[error("session not found")]
    NotFound,
    #[error("organization reached its limit of {limit} concurrent sessions")]
    PolicyExceeded { limit: usize },
    #[error("unauthorized")]
    Unauthorized,
    #[error("already paired with caster {0}")]
    AlreadyPaired(Uuid),
    #[error("connection closed")]
    Closed,
}

impl RequestError {
    /// What the viewer is told about the refusal, if anything.
    pub fn reply(&self) -> Option<ViewerMessage> {
        match self {
            Self::NotFound => Some(ViewerMessage::SessionIdNotFound),
            Self::Unauthorized => Some(ViewerMessage::Unauthorized),
            Self::PolicyExceeded { .. } => Some(ViewerMessage::ShowMessage {
                text: SESSION_LIMIT_MESSAGE.to_string(),
            }),
            Self::EmptyTarget | Self::AlreadyPaired(_) | Self::Closed => None,
        }
    }
}

/// Result of dispatching one viewer message.
///
/// Replies to the viewer itself travel back to the connection task, which
/// writes them straight to the socket. They never pass through the viewer's
/// own hub queue, so a backlog there cannot delay or drop them.
#[derive(Debug, PartialEq, Eq)]
pub struct Outcome {
    pub replies: Vec<ViewerMessage>,
    /// `Break` carries the close reason; the connection ends after the replies.
    pub flow: ControlFlow<String>,
}

impl Outcome {
    fn proceed(replies: Vec<ViewerMessage>) -> Self {
        Self {
            replies,
            flow: ControlFlow::Continue(()),
        }
    }
}

impl Default for Outcome {
    fn default() -> Self {
        Self::proceed(Vec::new())
    }
}

/// A relay had no live caster to deliver to.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("no live caster for this viewer")]
pub struct StaleRelay;

pub struct Broker {
    directory: Arc<SessionDirectory>,
    prejoin: Arc<PrejoinQueue>,
    hub: Arc<ConnectionHub>,
    access: Arc<dyn AccessProvider>,
    gate: AuthorizationGate,
    limiter: ConcurrencyLimiter,
    audit: Arc<dyn AuditSink>,
    settings: RemoteControlConfig,
}

impl Broker {
    pub fn new(
        directory: Arc<SessionDirectory>,
        prejoin: Arc<PrejoinQueue>,
        hub: Arc<ConnectionHub>,
        access: Arc<dyn AccessProvider>,
        audit: Arc<dyn AuditSink>,
        settings: RemoteControlConfig,
    ) -> Self {
        Self {
            directory,
            prejoin,
            hub,
            gate: AuthorizationGate::new(Arc::clone(&access)),
            access,
            limiter: ConcurrencyLimiter::new(settings.session_limit as usize),
            audit,
            settings,
        }
    }

    /// Dispatch one inbound viewer message.
    pub async fn handle(&self, ctx: &mut ViewerContext, request: ViewerRequest) -> Outcome {
        let connection_id = ctx.connection_id;
        match request {
            ViewerRequest::WaitForDevice {
                prejoin_id,
                device_id,
            } => self.wait_for_device(ctx, prejoin_id, &device_id),
            ViewerRequest::RequestSession {
                target,
                requester_name,
                mode,
                otp,
            } => {
                let request = SessionRequest {
                    target,
                    requester_name,
                    mode,
                    otp,
                };
                return self.answer_request(ctx, request).await;
            }
            ViewerRequest::SendIceCandidate {
                candidate,
                sdp_mline_index,
                sdp_mid,
            } => {
                let result = self
                    .relay_ice_candidate(ctx, candidate, sdp_mline_index, sdp_mid)
                    .await;
                log_relay(connection_id, "ice_candidate", result);
            }
            ViewerRequest::SendRtcAnswer { sdp } => {
                let result = self.relay_rtc_answer(ctx, sdp).await;
                log_relay(connection_id, "rtc_answer", result);
            }
            ViewerRequest::SendDto { payload } => {
                let result = self.relay_dto(ctx, payload).await;
                log_relay(connection_id, "dto", result);
            }
            ViewerRequest::ChangeWindowsSession { windows_session_id } => {
                let result = self.change_windows_session(ctx, windows_session_id).await;
                log_relay(connection_id, "change_windows_session", result);
            }
        }
        Outcome::default()
    }

    async fn answer_request(&self, ctx: &mut ViewerContext, request: SessionRequest) -> Outcome {
        let connection_id = ctx.connection_id;
        let error = match self.request_session(ctx, request).await {
            Ok(Admission::Requested) => {
                return Outcome::proceed(vec![ViewerMessage::RequestingScreenCast]);
            }
            Ok(Admission::Granted) => return Outcome::default(),
            Err(e) => e,
        };

        match &error {
            RequestError::EmptyTarget => {
                tracing::debug!(%connection_id, "Ignoring session request without target");
            }
            RequestError::NotFound => {
                tracing::info!(%connection_id, "Requested session not found");
            }
            e => tracing::warn!(%connection_id, "Session request refused: {e}"),
        }

        let replies = error.reply().into_iter().collect();
        match error {
            RequestError::PolicyExceeded { .. } => Outcome {
                replies,
                flow: ControlFlow::Break(SESSION_LIMIT_CLOSE_REASON.to_string()),
            },
            _ => Outcome::proceed(replies),
        }
    }

    /// `Idle -> AwaitingDevice`. Replaces any earlier wait of this viewer.
    pub fn wait_for_device(&self, ctx: &mut ViewerContext, token: Uuid, device_id: &str) {
        match ctx.state {
            ViewerState::Active | ViewerState::Closed => {
                tracing::debug!(
                    connection_id = %ctx.connection_id,
                    state = ?ctx.state,
                    "Ignoring prejoin registration"
                );
                return;
            }
            _ => {}
        }

        self.release_prejoin(ctx);
        self.prejoin.wait(token, device_id);
        self.hub.add_to_group(&token.to_string(), ctx.connection_id);
        ctx.prejoin = Some(PrejoinWait {
            token,
            device_id: device_id.to_string(),
        });
        ctx.state = ViewerState::AwaitingDevice;
        tracing::info!(
            connection_id = %ctx.connection_id,
            %token,
            device_id,
            "Viewer waiting for device"
        );
    }

    /// `Idle/AwaitingDevice -> Requesting -> Active | Unauthorized | Rejected`.
    pub async fn request_session(
        &self,
        ctx: &mut ViewerContext,
        request: SessionRequest,
    ) -> Result<Admission, RequestError> {
        match ctx.state {
            ViewerState::Closed => return Err(RequestError::Closed),
            ViewerState::Active => {
                let caster_id = ctx.caster_id().unwrap_or_default();
                return Err(RequestError::AlreadyPaired(caster_id));
            }
            _ => {}
        }

        let target = request.target.trim();
        if target.is_empty() {
            return Err(RequestError::EmptyTarget);
        }

        ctx.state = ViewerState::Requesting;

        let Some(session) = self.resolve_target(target, request.mode) else {
            ctx.state = ViewerState::Rejected;
            return Err(RequestError::NotFound);
        };
        let (caster_id, device_id, machine_name) =
            session.read(|s| (s.caster_id, s.device_id.clone(), s.machine_name.clone()));

        self.consume_prejoin(ctx, &device_id);

        ctx.mode = request.mode;
        ctx.requester_name = request.requester_name;
        ctx.otp = request.otp.filter(|o| !o.trim().is_empty());

        let user = match ctx.requester.user_id.as_deref() {
            Some(user_id) => self.access.get_user(user_id).await,
            None => None,
        };

        if let Some(user) = &user {
            if ctx.requester_name.trim().is_empty() {
                ctx.requester_name = user.display_or_user_name().to_string();
            }
            if !self
                .limiter
                .admit(&self.directory, &user.organization_id, caster_id)
            {
                return Err(self.reject_over_limit(ctx));
            }
        }

        self.record_request(SessionRequestedEvent {
            login: user.as_ref().map(|u| u.user_name.clone()),
            user_id: ctx.requester.user_id.clone(),
            organization_id: user.as_ref().map(|u| u.organization_id.clone()),
            machine_name,
            requester_name: ctx.requester_name.clone(),
            connection_id: ctx.connection_id,
            caster_id,
            mode: ctx.mode,
            remote_addr: ctx.requester.remote_addr,
        });

        match ctx.mode {
            RemoteControlMode::Normal => {
                self.activate(ctx, caster_id, session, user.as_ref());
                self.request_attended(ctx, caster_id).await;
                Ok(Admission::Requested)
            }
            RemoteControlMode::Unattended => {
                let authorization = self
                    .gate
                    .authorize(
                        ctx.otp.as_deref(),
                        &device_id,
                        ctx.requester.user_id.as_deref(),
                    )
                    .await;
                match authorization {
                    Authorization::Allowed => {
                        self.activate(ctx, caster_id, session, user.as_ref());
                        self.request_unattended(ctx, caster_id, user.as_ref()).await;
                        Ok(Admission::Granted)
                    }
                    Authorization::Denied => {
                        ctx.state = ViewerState::Unauthorized;
                        Err(RequestError::Unauthorized)
                    }
                }
            }
        }
    }

    /// Resolve a caller-supplied target. In normal mode an attended code is
    /// tried first; otherwise the target must be a caster connection id.
    pub fn resolve_target(&self, target: &str, mode: RemoteControlMode) -> Option<SessionHandle> {
        if mode == RemoteControlMode::Normal
            && let Some(session) = self.directory.find_by_attended_code(target)
        {
            return Some(session);
        }
        let caster_id = Uuid::parse_str(target).ok()?;
        self.directory.lookup(caster_id)
    }

    /// Drop this viewer's prejoin token if it waits for `device_id`.
    fn consume_prejoin(&self, ctx: &mut ViewerContext, device_id: &str) {
        let Some(wait) = ctx.prejoin.take_if(|w| w.device_id == device_id) else {
            return;
        };
        self.prejoin.consume(&wait.device_id, wait.token);
        self.hub
            .remove_from_group(&wait.token.to_string(), ctx.connection_id);
        tracing::debug!(connection_id = %ctx.connection_id, token = %wait.token, "Prejoin consumed");
    }

    /// Drop this viewer's prejoin token whatever device it waits for.
    fn release_prejoin(&self, ctx: &mut ViewerContext) {
        if let Some(wait) = ctx.prejoin.take() {
            self.prejoin.consume(&wait.device_id, wait.token);
            self.hub
                .remove_from_group(&wait.token.to_string(), ctx.connection_id);
        }
    }

    /// The caller exceeded its organization's ceiling. The connection task
    /// closes the socket on this error, so the prejoin token goes now.
    fn reject_over_limit(&self, ctx: &mut ViewerContext) -> RequestError {
        ctx.state = ViewerState::Rejected;
        self.release_prejoin(ctx);
        RequestError::PolicyExceeded {
            limit: self.limiter.ceiling(),
        }
    }

    /// `Requesting -> Active`: store the pairing and stamp the session.
    fn activate(
        &self,
        ctx: &mut ViewerContext,
        caster_id: Uuid,
        session: SessionHandle,
        user: Option<&UserRecord>,
    ) {
        let mode = ctx.mode;
        let connection_id = ctx.connection_id;
        session.update(|s| {
            s.mode = mode;
            s.invited_viewers.insert(connection_id);
            if let Some(user) = user {
                s.organization_id = Some(user.organization_id.clone());
                s.requester_user_name = Some(user.user_name.clone());
                s.requester_connection_id = Some(connection_id);
            }
        });
        ctx.pairing = Some(Pairing { caster_id, session });
        ctx.state = ViewerState::Active;
        tracing::info!(%connection_id, %caster_id, %mode, "Viewer paired with caster");
    }

    async fn request_attended(&self, ctx: &ViewerContext, caster_id: Uuid) {
        let delivered = self
            .hub
            .send(
                caster_id,
                CasterMessage::RequestScreenCast {
                    viewer_id: ctx.connection_id,
                    requester_name: ctx.requester_name.clone(),
                    notify_user: self.settings.notify_user,
                    use_webrtc: self.settings.use_webrtc,
                },
            )
            .await;
        if !delivered {
            tracing::warn!(%caster_id, "Caster went away before the screen cast request");
        }
    }

    async fn request_unattended(
        &self,
        ctx: &ViewerContext,
        caster_id: Uuid,
        user: Option<&UserRecord>,
    ) {
        let organization_name = match user {
            Some(user) => self.access.organization_name(&user.organization_id).await,
            None => None,
        };
        let delivered = self
            .hub
            .send(
                caster_id,
                CasterMessage::GetScreenCast {
                    viewer_id: ctx.connection_id,
                    requester_name: ctx.requester_name.clone(),
                    notify_user: self.settings.notify_user,
                    enforce_attended_access: self.settings.enforce_attended_access,
                    use_webrtc: self.settings.use_webrtc,
                    organization_name,
                },
            )
            .await;
        if !delivered {
            tracing::warn!(%caster_id, "Caster went away before the screen cast request");
        }
    }

    /// Fire-and-forget: audit failures never affect the session.
    fn record_request(&self, event: SessionRequestedEvent) {
        let audit = Arc::clone(&self.audit);
        tokio::spawn(async move {
            if let Err(e) = audit.record(event).await {
                tracing::warn!("Failed to record audit event: {e}");
            }
        });
    }

    fn paired_caster(&self, ctx: &ViewerContext) -> Result<Uuid, StaleRelay> {
        match (&ctx.pairing, ctx.state) {
            (Some(pairing), ViewerState::Active) => Ok(pairing.caster_id),
            _ => Err(StaleRelay),
        }
    }

    async fn forward(&self, caster_id: Uuid, msg: CasterMessage) -> Result<(), StaleRelay> {
        if self.hub.send(caster_id, msg).await {
            Ok(())
        } else {
            Err(StaleRelay)
        }
    }

    pub async fn relay_ice_candidate(
        &self,
        ctx: &ViewerContext,
        candidate: String,
        sdp_mline_index: u32,
        sdp_mid: String,
    ) -> Result<(), StaleRelay> {
        let caster_id = self.paired_caster(ctx)?;
        self.forward(
            caster_id,
            CasterMessage::ReceiveIceCandidate {
                viewer_id: ctx.connection_id,
                candidate,
                sdp_mline_index,
                sdp_mid,
            },
        )
        .await
    }

    pub async fn relay_rtc_answer(&self, ctx: &ViewerContext, sdp: String) -> Result<(), StaleRelay> {
        let caster_id = self.paired_caster(ctx)?;
        self.forward(
            caster_id,
            CasterMessage::ReceiveRtcAnswer {
                viewer_id: ctx.connection_id,
                sdp,
            },
        )
        .await
    }

    pub async fn relay_dto(&self, ctx: &ViewerContext, payload: String) -> Result<(), StaleRelay> {
        let caster_id = self.paired_caster(ctx)?;
        self.forward(
            caster_id,
            CasterMessage::SendDtoToClient {
                viewer_id: ctx.connection_id,
                payload,
            },
        )
        .await
    }

    /// Forward a desktop session switch to the device's service agent.
    /// Normal-mode sessions ignore it.
    pub async fn change_windows_session(
        &self,
        ctx: &ViewerContext,
        windows_session_id: u32,
    ) -> Result<(), StaleRelay> {
        let caster_id = self.paired_caster(ctx)?;
        if ctx.mode != RemoteControlMode::Unattended {
            return Ok(());
        }
        let service_id = ctx
            .session()
            .and_then(|s| s.read(|s| s.service_id))
            .ok_or(StaleRelay)?;
        let msg = AgentMessage::ChangeWindowsSession {
            caster_id,
            viewer_id: ctx.connection_id,
            windows_session_id,
        };
        if self.hub.send(service_id, msg).await {
            Ok(())
        } else {
            Err(StaleRelay)
        }
    }

    /// Cleanup for any state. Notifies the paired caster once and releases
    /// the prejoin token. Safe to call more than once.
    pub async fn disconnect(&self, ctx: &mut ViewerContext) {
        let previous = std::mem::replace(&mut ctx.state, ViewerState::Closed);
        if previous == ViewerState::Closed {
            return;
        }

        self.release_prejoin(ctx);

        if previous == ViewerState::Active
            && let Some(pairing) = &ctx.pairing
        {
            let connection_id = ctx.connection_id;
            pairing.session.update(|s| s.invited_viewers.remove(&connection_id));
            self.hub
                .send(
                    pairing.caster_id,
                    CasterMessage::ViewerDisconnected {
                        viewer_id: ctx.connection_id,
                    },
                )
                .await;
        }

        tracing::info!(connection_id = %ctx.connection_id, state = ?previous, "Viewer disconnected");
    }
}

fn log_relay(connection_id: Uuid, kind: &str, result: Result<(), StaleRelay>) {
    if let Err(e) = result {
        tracing::debug!(%connection_id, kind, "Dropped relay: {e}");
    }
}
