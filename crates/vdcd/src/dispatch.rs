//! Message dispatcher: one exhaustive match over the inbound catalog.
//!
//! Requests produce a correlated response (the request's `messageId` is
//! copied onto it after the handler runs); notifications produce none.
//! Handler failures turn into generic 500 responses for requests and log
//! lines for notifications. Unknown entities yield 404-class responses for
//! requests and dropped-with-a-log notifications. Nothing in here ever
//! closes the session.

use crate::entities::{DeviceError, VdcHost, API_VERSION};
use crate::mediator;
use crate::scenes::SceneMode;
use crate::session::Session;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use vdcproto::{
    DsUid, Envelope, Message, PropertyValue, CODE_ERROR, CODE_NOT_FOUND, CODE_OK,
};

/// Work the connection loop must do after a handler ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostAction {
    None,
    /// Hello response queued: activate the session, start keepalive,
    /// announce the entity tree.
    HelloComplete,
    /// Bye received: drain the writer and tear down.
    Bye,
}

pub struct DispatchOutcome {
    pub response: Option<Envelope>,
    pub post: PostAction,
}

impl DispatchOutcome {
    fn none() -> Self {
        Self {
            response: None,
            post: PostAction::None,
        }
    }

    fn respond(envelope: Envelope) -> Self {
        Self {
            response: Some(envelope),
            post: PostAction::None,
        }
    }
}

/// Dispatch one decoded envelope.
pub async fn dispatch(
    host: &Arc<Mutex<VdcHost>>,
    session: &Session,
    envelope: Envelope,
) -> DispatchOutcome {
    let message_id = envelope.message_id;
    let is_request = envelope.message.is_request();
    debug!(kind = envelope.message.kind(), ?message_id, "dispatch");

    let mut outcome = handle(host, session, envelope).await;

    // Correlate: responses echo the request's messageId.
    if is_request {
        if let Some(response) = outcome.response.as_mut() {
            response.message_id = message_id;
        }
    }
    outcome
}

async fn handle(
    host: &Arc<Mutex<VdcHost>>,
    session: &Session,
    envelope: Envelope,
) -> DispatchOutcome {
    match envelope.message {
        // === Handshake and keepalive ===
        Message::Hello { api_version } => {
            session.on_hello_received(api_version);
            let host = host.lock().await;
            DispatchOutcome {
                response: Some(Envelope::notification(Message::HelloResponse {
                    dsuid: host.dsuid(),
                    api_version: API_VERSION.to_string(),
                })),
                post: PostAction::HelloComplete,
            }
        }
        Message::Ping => DispatchOutcome::respond(Envelope::notification(Message::Pong)),
        Message::Pong => {
            session.on_pong();
            DispatchOutcome::none()
        }
        Message::Bye => {
            session.on_bye();
            DispatchOutcome {
                response: None,
                post: PostAction::Bye,
            }
        }

        // === Property access ===
        Message::GetProperty { dsuid, query } => {
            let host = host.lock().await;
            match mediator::get_properties(&host, &dsuid, &query) {
                Ok(properties) => DispatchOutcome::respond(Envelope::notification(
                    Message::GetPropertyResponse { properties },
                )),
                Err(e) => {
                    warn!(%dsuid, error = %e, "get-property for unknown entity");
                    DispatchOutcome::respond(Envelope::generic_response(
                        CODE_NOT_FOUND,
                        e.to_string(),
                    ))
                }
            }
        }
        Message::SetProperty { dsuid, properties } => {
            let mut host = host.lock().await;
            match mediator::set_properties(&mut host, &dsuid, &properties) {
                Ok(summary) if summary.is_failure() => {
                    let description = summary
                        .first_failure()
                        .unwrap_or_else(|| "write failed".to_string());
                    DispatchOutcome::respond(Envelope::generic_response(CODE_ERROR, description))
                }
                Ok(_) => DispatchOutcome::respond(Envelope::generic_response(CODE_OK, "OK")),
                Err(e) => {
                    warn!(%dsuid, error = %e, "set-property for unknown entity");
                    DispatchOutcome::respond(Envelope::generic_response(
                        CODE_NOT_FOUND,
                        e.to_string(),
                    ))
                }
            }
        }

        // === Generic request ===
        Message::GenericRequest {
            dsuid,
            method,
            params,
        } => {
            let response = run_generic_request(host, dsuid, &method, &params).await;
            DispatchOutcome::respond(response)
        }

        // === Removal ===
        Message::Remove { dsuid } => {
            let mut host = host.lock().await;
            let code = if host.remove_device(&dsuid) {
                info!(%dsuid, "device removed on controller request");
                CODE_OK
            } else {
                warn!(%dsuid, "remove for unknown device");
                CODE_NOT_FOUND
            };
            DispatchOutcome::respond(Envelope::notification(Message::RemoveResult { code }))
        }

        // === Scene notifications ===
        Message::CallScene {
            dsuid,
            scene,
            force,
        } => {
            with_device(host, &dsuid, "call-scene", |device| {
                device.call_scene(scene, force, SceneMode::Normal).map(|_| ())
            })
            .await;
            DispatchOutcome::none()
        }
        Message::SaveScene { dsuid, scene } => {
            with_device(host, &dsuid, "save-scene", |device| {
                device.save_scene(scene, None).map(|_| ())
            })
            .await;
            DispatchOutcome::none()
        }
        Message::UndoScene { dsuid } => {
            with_device(host, &dsuid, "undo-scene", |device| {
                device.undo_scene();
                Ok(())
            })
            .await;
            DispatchOutcome::none()
        }
        Message::CallMinScene { dsuid, scene } => {
            with_device(host, &dsuid, "call-min-scene", |device| {
                device.call_min_scene(scene).map(|_| ())
            })
            .await;
            DispatchOutcome::none()
        }
        Message::SetLocalPriority { dsuid, scene } => {
            with_device(host, &dsuid, "set-local-priority", |device| {
                device.set_local_priority(scene);
                Ok(())
            })
            .await;
            DispatchOutcome::none()
        }

        // === Output notifications ===
        Message::SetOutputChannelValue {
            dsuid,
            channel,
            value,
            apply_now,
            transition_time,
        } => {
            with_device(host, &dsuid, "set-output-channel-value", |device| {
                device.set_output_channel_value(channel, value, apply_now, transition_time)
            })
            .await;
            DispatchOutcome::none()
        }
        Message::DimChannel {
            dsuid,
            channel,
            mode,
        } => {
            with_device(host, &dsuid, "dim-channel", |device| {
                device.dim_channel(channel, mode)
            })
            .await;
            DispatchOutcome::none()
        }
        Message::SetControlValue { dsuid, name, value } => {
            with_device(host, &dsuid, "set-control-value", |device| {
                device.set_control_value(&name, value);
                Ok(())
            })
            .await;
            DispatchOutcome::none()
        }
        Message::Identify { dsuid, duration } => {
            let host = host.lock().await;
            match host.find_device(&dsuid) {
                Some(device) => device.identify(duration),
                None => warn!(%dsuid, "identify for unknown device"),
            }
            DispatchOutcome::none()
        }

        // === Host-outbound tags arriving inbound: drop with a log ===
        Message::HelloResponse { .. }
        | Message::GetPropertyResponse { .. }
        | Message::GenericResponse { .. }
        | Message::RemoveResult { .. }
        | Message::PushProperty { .. }
        | Message::AnnounceConnector { .. }
        | Message::AnnounceDevice { .. }
        | Message::Vanish { .. } => {
            warn!(kind = envelope.message.kind(), "host-outbound message received from peer, dropping");
            DispatchOutcome::none()
        }
    }
}

/// Run a device-targeted notification handler: unknown devices and handler
/// errors are logged, never answered.
async fn with_device<F>(host: &Arc<Mutex<VdcHost>>, dsuid: &DsUid, operation: &str, f: F)
where
    F: FnOnce(&mut crate::entities::Device) -> Result<(), DeviceError>,
{
    let mut host = host.lock().await;
    match host.find_device_mut(dsuid) {
        Some(device) => {
            if let Err(e) = f(device) {
                warn!(%dsuid, operation, error = %e, "notification handler failed");
            }
        }
        None => warn!(%dsuid, operation, "notification for unknown device, dropped"),
    }
}

async fn run_generic_request(
    host: &Arc<Mutex<VdcHost>>,
    dsuid: Option<DsUid>,
    method: &str,
    params: &PropertyValue,
) -> Envelope {
    let params_map = params.as_map().cloned().unwrap_or_default();

    let Some(dsuid) = dsuid else {
        return Envelope::generic_response(CODE_ERROR, format!("Unknown method '{method}'"));
    };

    let host = host.lock().await;
    let Some(device) = host.find_device(&dsuid) else {
        return Envelope::generic_response(CODE_NOT_FOUND, format!("unknown entity {dsuid}"));
    };

    match device.call_action(method, &params_map) {
        Ok(result) => Envelope::notification(Message::GenericResponse {
            code: CODE_OK,
            description: "OK".to_string(),
            result,
        }),
        Err(DeviceError::UnknownAction(_)) => {
            Envelope::generic_response(CODE_ERROR, format!("Unknown method '{method}'"))
        }
        Err(e) => Envelope::generic_response(CODE_ERROR, e.to_string()),
    }
}

/// Response for a payload that decoded to no known message: requests (those
/// carrying a messageId) get a generic 500; notifications are dropped.
pub fn unsupported_type_response(kind: &str, message_id: Option<u32>) -> Option<Envelope> {
    match message_id {
        Some(id) => {
            warn!(kind, "unsupported request type");
            let mut response =
                Envelope::generic_response(CODE_ERROR, format!("Unsupported message type {kind}"));
            response.message_id = Some(id);
            Some(response)
        }
        None => {
            warn!(kind, "unsupported notification type, dropped");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::output::OutputFunction;
    use crate::components::output_channel::channel_type;
    use crate::persistence::Store;
    use crate::session::{Session, SessionTiming};
    use tempfile::TempDir;
    use tokio::sync::mpsc;
    use vdcconf::VdcConfig;

    struct Fixture {
        host: Arc<Mutex<VdcHost>>,
        session: Session,
        rx: mpsc::UnboundedReceiver<Envelope>,
        device: DsUid,
        _dir: TempDir,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path().join("state.yaml")).unwrap();
        let mut host = VdcHost::new(&VdcConfig::default(), store);
        let connector = host.create_connector(0, "gw", "m");
        let device = host
            .connector_mut(&connector)
            .unwrap()
            .create_device("lamp", 0, "lamp", "dim-1");
        {
            let d = host.find_device_mut(&device).unwrap();
            d.add_output(OutputFunction::Dimmer).unwrap();
            d.add_output_channel(channel_type::BRIGHTNESS, 0.0, 100.0, 0.1)
                .unwrap();
        }

        let (tx, rx) = mpsc::unbounded_channel();
        host.session_connected(tx.clone());
        let session = Session::new(tx, "127.0.0.1:4711".parse().unwrap(), SessionTiming::default());

        Fixture {
            host: Arc::new(Mutex::new(host)),
            session,
            rx,
            device,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn hello_yields_correlated_response() {
        let f = fixture().await;
        let request = Envelope::request(7, Message::Hello { api_version: None });

        let outcome = dispatch(&f.host, &f.session, request).await;
        assert_eq!(outcome.post, PostAction::HelloComplete);
        let response = outcome.response.unwrap();
        assert_eq!(response.message_id, Some(7));
        match response.message {
            Message::HelloResponse { dsuid, api_version } => {
                assert_eq!(dsuid, f.host.lock().await.dsuid());
                assert_eq!(api_version, API_VERSION);
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn ping_answered_with_pong_without_id() {
        let f = fixture().await;
        let outcome = dispatch(&f.host, &f.session, Envelope::notification(Message::Ping)).await;
        let response = outcome.response.unwrap();
        assert_eq!(response.message, Message::Pong);
        assert_eq!(response.message_id, None);
    }

    #[tokio::test]
    async fn get_property_unknown_uid_is_404() {
        let f = fixture().await;
        let stranger = DsUid::device("x", "y", 0);
        let request = Envelope::request(
            3,
            Message::GetProperty {
                dsuid: stranger,
                query: PropertyValue::empty_map(),
            },
        );

        let response = dispatch(&f.host, &f.session, request).await.response.unwrap();
        assert_eq!(response.message_id, Some(3));
        match response.message {
            Message::GenericResponse { code, .. } => assert_eq!(code, CODE_NOT_FOUND),
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn set_output_channel_value_mutates_without_response() {
        let mut f = fixture().await;
        let notification = Envelope::notification(Message::SetOutputChannelValue {
            dsuid: f.device,
            channel: channel_type::BRIGHTNESS,
            value: 50.0,
            apply_now: true,
            transition_time: None,
        });

        let outcome = dispatch(&f.host, &f.session, notification).await;
        assert!(outcome.response.is_none());

        let host = f.host.lock().await;
        let value = host
            .find_device(&f.device)
            .unwrap()
            .output()
            .unwrap()
            .channel_value(channel_type::BRIGHTNESS);
        assert_eq!(value, Some(50.0));
        drop(host);

        // pushChanges on: the controller write is echoed exactly once.
        let mut pushes = 0;
        while f.rx.try_recv().is_ok() {
            pushes += 1;
        }
        assert_eq!(pushes, 1);
    }

    #[tokio::test]
    async fn scene_cycle_through_dispatch() {
        let f = fixture().await;

        let set = |value: f64| {
            Envelope::notification(Message::SetOutputChannelValue {
                dsuid: f.device,
                channel: channel_type::BRIGHTNESS,
                value,
                apply_now: true,
                transition_time: None,
            })
        };

        dispatch(&f.host, &f.session, set(65.0)).await;
        dispatch(
            &f.host,
            &f.session,
            Envelope::notification(Message::SaveScene {
                dsuid: f.device,
                scene: 17,
            }),
        )
        .await;
        dispatch(&f.host, &f.session, set(20.0)).await;
        dispatch(
            &f.host,
            &f.session,
            Envelope::notification(Message::CallScene {
                dsuid: f.device,
                scene: 17,
                force: false,
            }),
        )
        .await;

        let host = f.host.lock().await;
        let value = host
            .find_device(&f.device)
            .unwrap()
            .output()
            .unwrap()
            .channel_value(channel_type::BRIGHTNESS);
        assert_eq!(value, Some(65.0));
        drop(host);

        dispatch(
            &f.host,
            &f.session,
            Envelope::notification(Message::UndoScene { dsuid: f.device }),
        )
        .await;
        let host = f.host.lock().await;
        let value = host
            .find_device(&f.device)
            .unwrap()
            .output()
            .unwrap()
            .channel_value(channel_type::BRIGHTNESS);
        assert_eq!(value, Some(20.0));
    }

    #[tokio::test]
    async fn remove_reports_result_code() {
        let f = fixture().await;
        let request = Envelope::request(9, Message::Remove { dsuid: f.device });
        let response = dispatch(&f.host, &f.session, request).await.response.unwrap();
        assert_eq!(response.message_id, Some(9));
        assert_eq!(response.message, Message::RemoveResult { code: CODE_OK });

        // Second removal: gone.
        let request = Envelope::request(10, Message::Remove { dsuid: f.device });
        let response = dispatch(&f.host, &f.session, request).await.response.unwrap();
        assert_eq!(
            response.message,
            Message::RemoveResult {
                code: CODE_NOT_FOUND
            }
        );
    }

    #[tokio::test]
    async fn generic_request_runs_device_action() {
        let f = fixture().await;
        {
            let mut host = f.host.lock().await;
            let device = host.find_device_mut(&f.device).unwrap();
            device.register_action(
                "blink",
                "blink the output",
                Arc::new(|params| {
                    let count = params
                        .get("count")
                        .and_then(|v| v.as_int())
                        .unwrap_or(1);
                    Ok(Some(PropertyValue::Int(count * 2)))
                }),
            );
        }

        let mut params = PropertyValue::empty_map();
        params.set_path("count", 3i64.into());
        let request = Envelope::request(
            5,
            Message::GenericRequest {
                dsuid: Some(f.device),
                method: "blink".into(),
                params,
            },
        );

        let response = dispatch(&f.host, &f.session, request).await.response.unwrap();
        match response.message {
            Message::GenericResponse { code, result, .. } => {
                assert_eq!(code, CODE_OK);
                assert_eq!(result.unwrap().as_int(), Some(6));
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn generic_request_unknown_method_is_500() {
        let f = fixture().await;
        let request = Envelope::request(
            6,
            Message::GenericRequest {
                dsuid: Some(f.device),
                method: "frobnicate".into(),
                params: PropertyValue::empty_map(),
            },
        );
        let response = dispatch(&f.host, &f.session, request).await.response.unwrap();
        match response.message {
            Message::GenericResponse { code, description, .. } => {
                assert_eq!(code, CODE_ERROR);
                assert!(description.contains("frobnicate"));
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn notification_for_unknown_device_is_dropped() {
        let f = fixture().await;
        let stranger = DsUid::device("x", "y", 0);
        let outcome = dispatch(
            &f.host,
            &f.session,
            Envelope::notification(Message::CallScene {
                dsuid: stranger,
                scene: 1,
                force: false,
            }),
        )
        .await;
        assert!(outcome.response.is_none());
    }

    #[test]
    fn unsupported_request_gets_500_with_echoed_id() {
        let response = unsupported_type_response("fancyNewThing", Some(12)).unwrap();
        assert_eq!(response.message_id, Some(12));
        match response.message {
            Message::GenericResponse { code, description, .. } => {
                assert_eq!(code, CODE_ERROR);
                assert!(description.contains("fancyNewThing"));
            }
            other => panic!("unexpected response: {other:?}"),
        }

        assert!(unsupported_type_response("fancyNewThing", None).is_none());
    }
}
