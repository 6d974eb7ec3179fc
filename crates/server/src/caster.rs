//! Caster-side bookkeeping: registration into the session directory,
//! prejoin wake-ups, caster to viewer relay and teardown.

use std::sync::Arc;

use castgate_protocol::{CasterMessage, CasterRequest, SessionInfo, ViewerMessage};
use uuid::Uuid;

use crate::directory::{SessionDirectory, SessionHandle};
use crate::hub::ConnectionHub;
use crate::prejoin::PrejoinQueue;

/// Identity a caster announces in its first message.
#[derive(Debug, Clone)]
pub struct CasterRegistration {
    pub device_id: String,
    pub machine_name: String,
    pub service_id: Option<Uuid>,
}

pub struct CasterService {
    directory: Arc<SessionDirectory>,
    prejoin: Arc<PrejoinQueue>,
    hub: Arc<ConnectionHub>,
}

impl CasterService {
    pub fn new(
        directory: Arc<SessionDirectory>,
        prejoin: Arc<PrejoinQueue>,
        hub: Arc<ConnectionHub>,
    ) -> Self {
        Self {
            directory,
            prejoin,
            hub,
        }
    }

    /// Publish a caster in the directory, hand it its attended code and wake
    /// every viewer waiting for its device.
    pub async fn register(&self, caster_id: Uuid, registration: CasterRegistration) -> SessionHandle {
        let attended_session_id = self.directory.generate_attended_code();
        let mut info = SessionInfo::new(caster_id, &registration.device_id, &attended_session_id);
        info.machine_name = registration.machine_name;
        info.service_id = registration.service_id;
        let session = self.directory.insert(info);

        self.hub
            .send(
                caster_id,
                CasterMessage::Registered {
                    caster_id,
                    attended_session_id,
                },
            )
            .await;

        let mut woken = 0;
        for token in self.prejoin.waiters(&registration.device_id) {
            woken += self
                .hub
                .send_to_group(
                    &token.to_string(),
                    ViewerMessage::DeviceConnected {
                        caster_id,
                        device_id: registration.device_id.clone(),
                    },
                )
                .await;
        }

        tracing::info!(
            %caster_id,
            device_id = %registration.device_id,
            woken,
            "Caster registered"
        );
        session
    }

    pub async fn handle(&self, caster_id: Uuid, session: &SessionHandle, request: CasterRequest) {
        match request {
            CasterRequest::Register { .. } => {
                self.hub
                    .send(
                        caster_id,
                        CasterMessage::Error {
                            message: "already registered".to_string(),
                        },
                    )
                    .await;
            }
            CasterRequest::ViewerAttached { viewer_id } => {
                session.update(|s| {
                    s.invited_viewers.remove(&viewer_id);
                    s.viewers.insert(viewer_id);
                });
                tracing::info!(%caster_id, %viewer_id, "Viewer attached");
            }
            CasterRequest::ViewerDetached { viewer_id } => {
                session.update(|s| s.viewers.remove(&viewer_id));
                tracing::info!(%caster_id, %viewer_id, "Viewer detached");
            }
            CasterRequest::SendRtcOffer { viewer_id, sdp } => {
                self.to_viewer(caster_id, session, viewer_id, ViewerMessage::ReceiveRtcOffer { sdp })
                    .await;
            }
            CasterRequest::SendIceCandidate {
                viewer_id,
                candidate,
                sdp_mline_index,
                sdp_mid,
            } => {
                self.to_viewer(
                    caster_id,
                    session,
                    viewer_id,
                    ViewerMessage::ReceiveIceCandidate {
                        candidate,
                        sdp_mline_index,
                        sdp_mid,
                    },
                )
                .await;
            }
            CasterRequest::SendDtoToBrowser { viewer_id, payload } => {
                self.to_viewer(
                    caster_id,
                    session,
                    viewer_id,
                    ViewerMessage::SendDtoToBrowser { payload },
                )
                .await;
            }
        }
    }

    /// Relay to one of this caster's own viewers. Any other connection id
    /// is dropped.
    async fn to_viewer(
        &self,
        caster_id: Uuid,
        session: &SessionHandle,
        viewer_id: Uuid,
        msg: ViewerMessage,
    ) {
        if !session.read(|s| is_paired_viewer(s, viewer_id)) {
            tracing::warn!(%caster_id, %viewer_id, "Dropping relay to a viewer not paired with this caster");
            return;
        }
        if !self.hub.send(viewer_id, msg).await {
            tracing::debug!(%caster_id, %viewer_id, "Viewer gone, dropping relay");
        }
    }

    /// Remove the caster's directory entry and tell its viewers.
    pub async fn disconnect(&self, caster_id: Uuid) {
        let Some(session) = self.directory.remove(caster_id) else {
            return;
        };
        let viewers = session.read(|s| {
            let mut viewers = s.viewers.clone();
            viewers.extend(s.invited_viewers.iter().copied());
            viewers.extend(s.requester_connection_id);
            viewers
        });
        for viewer_id in viewers {
            self.hub
                .send(viewer_id, ViewerMessage::ScreenCasterDisconnected)
                .await;
        }
        tracing::info!(%caster_id, "Caster disconnected");
    }
}

fn is_paired_viewer(session: &SessionInfo, viewer_id: Uuid) -> bool {
    session.viewers.contains(&viewer_id)
        || session.invited_viewers.contains(&viewer_id)
        || session.requester_connection_id == Some(viewer_id)
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::hub::Outbound;

    fn service() -> (CasterService, Arc<SessionDirectory>, Arc<PrejoinQueue>, Arc<ConnectionHub>) {
        let directory = Arc::new(SessionDirectory::new());
        let prejoin = Arc::new(PrejoinQueue::new());
        let hub = Arc::new(ConnectionHub::new());
        let service = CasterService::new(
            Arc::clone(&directory),
            Arc::clone(&prejoin),
            Arc::clone(&hub),
        );
        (service, directory, prejoin, hub)
    }

    fn registration(device_id: &str) -> CasterRegistration {
        CasterRegistration {
            device_id: device_id.to_string(),
            machine_name: "FRONT-DESK".to_string(),
            service_id: None,
        }
    }

    fn next(rx: &mut mpsc::Receiver<Outbound>) -> Outbound {
        rx.try_recv().expect("message queued")
    }

    #[tokio::test]
    async fn register_publishes_session_and_replies_with_code() {
        let (service, directory, _, hub) = service();
        let (caster_id, mut rx) = hub.register();

        let session = service.register(caster_id, registration("dev-a")).await;
        let code = session.read(|s| s.attended_session_id.clone());
        assert_eq!(code.len(), 6);
        assert!(directory.lookup(caster_id).unwrap().ptr_eq(&session));
        assert!(directory.find_by_attended_code(&code).is_some());
        assert_eq!(
            next(&mut rx),
            Outbound::Caster(CasterMessage::Registered {
                caster_id,
                attended_session_id: code
            })
        );
    }

    #[tokio::test]
    async fn register_wakes_prejoin_waiters_for_device_only() {
        let (service, _, prejoin, hub) = service();
        let (waiting, mut waiting_rx) = hub.register();
        let (other, mut other_rx) = hub.register();
        let token = Uuid::new_v4();
        let other_token = Uuid::new_v4();
        prejoin.wait(token, "dev-a");
        hub.add_to_group(&token.to_string(), waiting);
        prejoin.wait(other_token, "dev-b");
        hub.add_to_group(&other_token.to_string(), other);

        let (caster_id, _rx) = hub.register();
        service.register(caster_id, registration("dev-a")).await;

        assert_eq!(
            next(&mut waiting_rx),
            Outbound::Viewer(ViewerMessage::DeviceConnected {
                caster_id,
                device_id: "dev-a".to_string()
            })
        );
        assert!(other_rx.try_recv().is_err());
        // Waking does not consume the token
        assert!(prejoin.is_waiting("dev-a", token));
    }

    #[tokio::test]
    async fn attach_detach_maintains_viewer_set() {
        let (service, _, _, hub) = service();
        let (caster_id, _rx) = hub.register();
        let session = service.register(caster_id, registration("dev-a")).await;
        let viewer = Uuid::new_v4();

        service
            .handle(caster_id, &session, CasterRequest::ViewerAttached { viewer_id: viewer })
            .await;
        assert!(session.read(|s| s.viewers.contains(&viewer)));
        service
            .handle(caster_id, &session, CasterRequest::ViewerDetached { viewer_id: viewer })
            .await;
        assert!(session.read(|s| s.viewers.is_empty()));
    }

    #[tokio::test]
    async fn relays_offer_to_addressed_viewer() {
        let (service, _, _, hub) = service();
        let (caster_id, _rx) = hub.register();
        let session = service.register(caster_id, registration("dev-a")).await;
        let (viewer_id, mut viewer_rx) = hub.register();
        session.update(|s| s.invited_viewers.insert(viewer_id));

        service
            .handle(
                caster_id,
                &session,
                CasterRequest::SendRtcOffer {
                    viewer_id,
                    sdp: "v=0".to_string(),
                },
            )
            .await;
        assert_eq!(
            next(&mut viewer_rx),
            Outbound::Viewer(ViewerMessage::ReceiveRtcOffer {
                sdp: "v=0".to_string()
            })
        );
    }

    #[tokio::test]
    async fn relays_to_unpaired_connections_are_dropped() {
        let (service, _, _, hub) = service();
        let (caster_id, _rx) = hub.register();
        let session = service.register(caster_id, registration("dev-a")).await;
        let (paired, mut paired_rx) = hub.register();
        let (stranger, mut stranger_rx) = hub.register();
        session.update(|s| s.invited_viewers.insert(paired));

        for viewer_id in [stranger, paired] {
            service
                .handle(
                    caster_id,
                    &session,
                    CasterRequest::SendRtcOffer {
                        viewer_id,
                        sdp: "evil".to_string(),
                    },
                )
                .await;
            service
                .handle(
                    caster_id,
                    &session,
                    CasterRequest::SendDtoToBrowser {
                        viewer_id,
                        payload: "AQID".to_string(),
                    },
                )
                .await;
        }
        assert!(stranger_rx.try_recv().is_err(), "stranger receives nothing");
        assert!(matches!(
            next(&mut paired_rx),
            Outbound::Viewer(ViewerMessage::ReceiveRtcOffer { .. })
        ));

        // Attaching keeps the viewer reachable; detaching cuts it off
        service
            .handle(caster_id, &session, CasterRequest::ViewerAttached { viewer_id: paired })
            .await;
        assert!(session.read(|s| s.invited_viewers.is_empty()));
        let _ = next(&mut paired_rx);
        service
            .handle(caster_id, &session, CasterRequest::ViewerDetached { viewer_id: paired })
            .await;
        service
            .handle(
                caster_id,
                &session,
                CasterRequest::SendIceCandidate {
                    viewer_id: paired,
                    candidate: "candidate:1".to_string(),
                    sdp_mline_index: 0,
                    sdp_mid: "0".to_string(),
                },
            )
            .await;
        assert!(paired_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn duplicate_register_is_an_error() {
        let (service, _, _, hub) = service();
        let (caster_id, mut rx) = hub.register();
        let session = service.register(caster_id, registration("dev-a")).await;
        let _ = next(&mut rx);

        service
            .handle(
                caster_id,
                &session,
                CasterRequest::Register {
                    device_id: "dev-a".to_string(),
                    machine_name: String::new(),
                    service_id: None,
                },
            )
            .await;
        assert!(matches!(
            next(&mut rx),
            Outbound::Caster(CasterMessage::Error { .. })
        ));
    }

    #[tokio::test]
    async fn disconnect_removes_entry_and_notifies_viewers() {
        let (service, directory, _, hub) = service();
        let (caster_id, _rx) = hub.register();
        let session = service.register(caster_id, registration("dev-a")).await;
        let (attached, mut attached_rx) = hub.register();
        let (requester, mut requester_rx) = hub.register();
        let (invited, mut invited_rx) = hub.register();
        session.update(|s| {
            s.viewers.insert(attached);
            s.invited_viewers.insert(invited);
            s.requester_connection_id = Some(requester);
        });

        service.disconnect(caster_id).await;
        assert!(directory.lookup(caster_id).is_none());
        assert_eq!(
            next(&mut attached_rx),
            Outbound::Viewer(ViewerMessage::ScreenCasterDisconnected)
        );
        assert_eq!(
            next(&mut requester_rx),
            Outbound::Viewer(ViewerMessage::ScreenCasterDisconnected)
        );
        assert_eq!(
            next(&mut invited_rx),
            Outbound::Viewer(ViewerMessage::ScreenCasterDisconnected)
        );

        // Second call is a no-op
        service.disconnect(caster_id).await;
        assert!(attached_rx.try_recv().is_err());
    }
}
