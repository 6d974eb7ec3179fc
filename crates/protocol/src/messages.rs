use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How a remote control session is authorized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteControlMode {
    /// Attended: a person at the device accepts or declines the request.
    #[default]
    Normal,
    /// Unattended: authorized by one-time password or device ACL.
    Unattended,
}

impl std::fmt::Display for RemoteControlMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Normal => f.write_str("normal"),
            Self::Unattended => f.write_str("unattended"),
        }
    }
}

/// Messages a viewer sends to the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ViewerRequest {
    /// Register interest in a device that is not online yet.
    WaitForDevice { prejoin_id: Uuid, device_id: String },
    /// Ask a caster for a screen cast. `target` is either an attended
    /// session code or a caster connection id.
    RequestSession {
        target: String,
        #[serde(default)]
        requester_name: String,
        #[serde(default)]
        mode: RemoteControlMode,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        otp: Option<String>,
    },
    /// ICE candidate for the paired caster
    SendIceCandidate {
        candidate: String,
        sdp_mline_index: u32,
        sdp_mid: String,
    },
    /// SDP answer for the paired caster
    SendRtcAnswer { sdp: String },
    /// Opaque payload (base64) relayed without inspection
    SendDto { payload: String },
    /// Switch the desktop session on an unattended device
    ChangeWindowsSession { windows_session_id: u32 },
}

/// Messages the broker sends to a viewer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ViewerMessage {
    /// First message on every viewer connection
    Connected { connection_id: Uuid },
    SessionIdNotFound,
    Unauthorized,
    ShowMessage { text: String },
    RequestingScreenCast,
    /// A device this viewer waits for came online
    DeviceConnected { caster_id: Uuid, device_id: String },
    ReceiveRtcOffer { sdp: String },
    ReceiveIceCandidate {
        candidate: String,
        sdp_mline_index: u32,
        sdp_mid: String,
    },
    SendDtoToBrowser { payload: String },
    ScreenCasterDisconnected,
    Error { message: String },
}

/// Messages a caster sends to the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CasterRequest {
    /// Must be the first message on a caster connection.
    Register {
        device_id: String,
        #[serde(default)]
        machine_name: String,
        /// Agent connection that handles windows session switching
        #[serde(default, skip_serializing_if = "Option::is_none")]
        service_id: Option<Uuid>,
    },
    ViewerAttached { viewer_id: Uuid },
    ViewerDetached { viewer_id: Uuid },
    SendRtcOffer { viewer_id: Uuid, sdp: String },
    SendIceCandidate {
        viewer_id: Uuid,
        candidate: String,
        sdp_mline_index: u32,
        sdp_mid: String,
    },
    SendDtoToBrowser { viewer_id: Uuid, payload: String },
}

/// Messages the broker sends to a caster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CasterMessage {
    Registered {
        caster_id: Uuid,
        attended_session_id: String,
    },
    /// Unattended invitation: the caster starts casting without a prompt.
    GetScreenCast {
        viewer_id: Uuid,
        requester_name: String,
        notify_user: bool,
        enforce_attended_access: bool,
        use_webrtc: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        organization_name: Option<String>,
    },
    /// Attended invitation: the person at the device must accept.
    RequestScreenCast {
        viewer_id: Uuid,
        requester_name: String,
        notify_user: bool,
        use_webrtc: bool,
    },
    ReceiveIceCandidate {
        viewer_id: Uuid,
        candidate: String,
        sdp_mline_index: u32,
        sdp_mid: String,
    },
    ReceiveRtcAnswer { viewer_id: Uuid, sdp: String },
    SendDtoToClient { viewer_id: Uuid, payload: String },
    ViewerDisconnected { viewer_id: Uuid },
    Error { message: String },
}

/// Messages the broker sends to a service agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentMessage {
    Registered { service_id: Uuid },
    ChangeWindowsSession {
        caster_id: Uuid,
        viewer_id: Uuid,
        windows_session_id: u32,
    },
}

/// One caster's active offering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub caster_id: Uuid,
    pub device_id: String,
    pub machine_name: String,
    /// Set once an authenticated requester joins
    pub organization_id: Option<String>,
    /// Human-facing short code
    pub attended_session_id: String,
    pub mode: RemoteControlMode,
    pub requester_user_name: Option<String>,
    /// Viewer connection that last requested this session
    pub requester_connection_id: Option<Uuid>,
    /// Agent connection responsible for this device, if any
    pub service_id: Option<Uuid>,
    pub viewers: HashSet<Uuid>,
    /// Viewers the broker paired with this caster that have not attached yet
    #[serde(default, skip_serializing_if = "HashSet::is_empty")]
    pub invited_viewers: HashSet<Uuid>,
}

impl SessionInfo {
    pub fn new(
        caster_id: Uuid,
        device_id: impl Into<String>,
        attended_session_id: impl Into<String>,
    ) -> Self {
        Self {
            caster_id,
            device_id: device_id.into(),
            machine_name: String::new(),
            organization_id: None,
            attended_session_id: attended_session_id.into(),
            mode: RemoteControlMode::Normal,
            requester_user_name: None,
            requester_connection_id: None,
            service_id: None,
            viewers: HashSet::new(),
            invited_viewers: HashSet::new(),
        }
    }
}

/// Response body for OTP issuance.
#[derive(Debug, Serialize, Deserialize)]
pub struct OtpResponse {
    pub otp: String,
    pub expires_in: u64,
}
