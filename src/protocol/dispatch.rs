//! Version-gated routing of inbound messages.

use std::fmt;
use std::sync::Arc;

use crate::error::ProtocolError;
use crate::protocol::message::{Message, MessageType, PROTOCOL_VERSION};
use crate::runner::handler::{EventHandler, HandlerRegistry};
use crate::runner::task::TaskAssignment;

/// What the daemon should do with one inbound message.
pub enum Action {
    /// Send exactly this message back.
    Reply(Message),
    /// Hand the assignment to the supervisor.
    Execute {
        assignment: TaskAssignment,
        handler: Arc<dyn EventHandler>,
    },
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reply(msg) => f.debug_tuple("Reply").field(msg).finish(),
            Self::Execute { assignment, handler } => f
                .debug_struct("Execute")
                .field("assignment", assignment)
                .field("handler", &handler.event())
                .finish(),
        }
    }
}

/// Routes decoded messages by version and type.
pub struct Dispatcher {
    runner_uuid: String,
    handlers: HandlerRegistry,
}

impl Dispatcher {
    /// `runner_uuid` is used for replies to messages that do not carry one.
    pub fn new(runner_uuid: impl Into<String>, handlers: HandlerRegistry) -> Self {
        Self {
            runner_uuid: runner_uuid.into(),
            handlers,
        }
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    pub fn dispatch(&self, msg: Message) -> Result<Action, ProtocolError> {
        match msg.version {
            PROTOCOL_VERSION => self.dispatch_v1(msg),
            version => Err(ProtocolError::UnsupportedVersion { version }),
        }
    }

    fn dispatch_v1(&self, msg: Message) -> Result<Action, ProtocolError> {
        match msg.kind {
            MessageType::Register => {
                tracing::info!(runner_uuid = %msg.runner_uuid, "Registration acknowledged");
                Ok(self.request_more(msg))
            }
            MessageType::Error => {
                tracing::warn!(
                    err_code = msg.err_code,
                    content = %msg.err_content,
                    "Server reported an error"
                );
                Ok(self.request_more(msg))
            }
            MessageType::Idle => {
                tracing::debug!("Server has no work");
                Ok(self.request_more(msg))
            }
            MessageType::RequestBuild => {
                let Some(handler) = self.handlers.get(&msg.event_name) else {
                    return Err(ProtocolError::UnknownEvent {
                        event: msg.event_name,
                        payload: msg.event_payload,
                    });
                };
                Ok(Action::Execute {
                    assignment: TaskAssignment::from_message(&msg),
                    handler,
                })
            }
            MessageType::BuildResult => Err(ProtocolError::UnexpectedType {
                kind: msg.kind.to_string(),
            }),
        }
    }

    fn request_more(&self, inbound: Message) -> Action {
        let runner_uuid = if inbound.runner_uuid.is_empty() {
            self.runner_uuid.clone()
        } else {
            inbound.runner_uuid
        };
        Action::Reply(Message::request_build(runner_uuid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::handler::testing::{Script, ScriptedHandler};

    fn dispatcher() -> Dispatcher {
        let mut handlers = HandlerRegistry::new();
        handlers.register(ScriptedHandler::new("push", Script::Succeed));
        Dispatcher::new("SELF", handlers)
    }

    #[test]
    fn acks_errors_and_idles_request_more_work() {
        let dispatcher = dispatcher();
        for kind in [MessageType::Register, MessageType::Error, MessageType::Idle] {
            let action = dispatcher.dispatch(Message::new(kind, "R1")).unwrap();
            match action {
                Action::Reply(reply) => {
                    assert_eq!(reply, Message::request_build("R1"), "{kind}");
                }
                other => panic!("{kind}: expected reply, got {other:?}"),
            }
        }
    }

    #[test]
    fn reply_falls_back_to_own_uuid() {
        let action = dispatcher().dispatch(Message::new(MessageType::Idle, "")).unwrap();
        assert!(matches!(action, Action::Reply(reply) if reply.runner_uuid == "SELF"));
    }

    #[test]
    fn known_event_is_executed() {
        let msg = Message {
            build_uuid: "B1".into(),
            event_name: "push".into(),
            ..Message::new(MessageType::RequestBuild, "R1")
        };
        match dispatcher().dispatch(msg).unwrap() {
            Action::Execute { assignment, handler } => {
                assert_eq!(assignment.build_uuid(), "B1");
                assert_eq!(handler.event(), "push");
            }
            other => panic!("expected execute, got {other:?}"),
        }
    }

    #[test]
    fn unknown_event_is_rejected() {
        let msg = Message {
            build_uuid: "B1".into(),
            event_name: "deploy".into(),
            event_payload: r#"{"env":"prod"}"#.into(),
            ..Message::new(MessageType::RequestBuild, "R1")
        };
        let err = dispatcher().dispatch(msg).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownEvent { ref event, .. } if event == "deploy"));
        let text = err.to_string();
        assert!(text.contains("deploy"));
        assert!(text.contains(r#"{"env":"prod"}"#));
    }

    #[test]
    fn inbound_build_result_is_rejected() {
        let err = dispatcher()
            .dispatch(Message::new(MessageType::BuildResult, "R1"))
            .unwrap_err();
        assert!(matches!(err, ProtocolError::UnexpectedType { .. }));
    }

    #[test]
    fn other_versions_are_rejected() {
        let msg = Message {
            version: 2,
            ..Message::new(MessageType::Idle, "R1")
        };
        let err = dispatcher().dispatch(msg).unwrap_err();
        assert!(matches!(err, ProtocolError::UnsupportedVersion { version: 2 }));
        assert!(err.to_string().contains("upgrad"));
    }
}
