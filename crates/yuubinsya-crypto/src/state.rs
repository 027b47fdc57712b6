//! Handshake state machine.
//!
//! Client: `Idle -> Sent -> Verifying -> Derived -> Complete`.
//! Server: `Idle -> Verifying -> Sent -> Derived -> Complete`.
//! Any step may instead fail, which is terminal.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Client => "client",
            Role::Server => "server",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Idle,
    Sent,
    Verifying,
    Derived,
    Complete,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeEvent {
    SendHeader,
    ReceiveHeader,
    DeriveKeys,
    Finish,
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeTransition {
    pub from: HandshakeState,
    pub to: HandshakeState,
    pub event: HandshakeEvent,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StateError {
    #[error("invalid {role} transition from {from:?} via {event:?}")]
    InvalidTransition {
        role: Role,
        from: HandshakeState,
        event: HandshakeEvent,
    },
}

#[derive(Debug, Clone)]
pub struct Handshake {
    role: Role,
    state: HandshakeState,
}

impl Handshake {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            state: HandshakeState::Idle,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn on_send_header(&mut self) -> Result<HandshakeTransition, StateError> {
        match (self.role, self.state) {
            (Role::Client, HandshakeState::Idle) | (Role::Server, HandshakeState::Verifying) => {
                self.transition(HandshakeEvent::SendHeader, HandshakeState::Sent)
            }
            _ => self.reject(HandshakeEvent::SendHeader),
        }
    }

    pub fn on_receive_header(&mut self) -> Result<HandshakeTransition, StateError> {
        match (self.role, self.state) {
            (Role::Client, HandshakeState::Sent) | (Role::Server, HandshakeState::Idle) => {
                self.transition(HandshakeEvent::ReceiveHeader, HandshakeState::Verifying)
            }
            _ => self.reject(HandshakeEvent::ReceiveHeader),
        }
    }

    pub fn on_derive_keys(&mut self) -> Result<HandshakeTransition, StateError> {
        match (self.role, self.state) {
            (Role::Client, HandshakeState::Verifying) | (Role::Server, HandshakeState::Sent) => {
                self.transition(HandshakeEvent::DeriveKeys, HandshakeState::Derived)
            }
            _ => self.reject(HandshakeEvent::DeriveKeys),
        }
    }

    pub fn on_finish(&mut self) -> Result<HandshakeTransition, StateError> {
        match self.state {
            HandshakeState::Derived => {
                self.transition(HandshakeEvent::Finish, HandshakeState::Complete)
            }
            _ => self.reject(HandshakeEvent::Finish),
        }
    }

    /// Move to `Failed`. Allowed from any non-terminal state.
    pub fn on_fail(&mut self) -> Result<HandshakeTransition, StateError> {
        match self.state {
            HandshakeState::Complete | HandshakeState::Failed => self.reject(HandshakeEvent::Fail),
            _ => self.transition(HandshakeEvent::Fail, HandshakeState::Failed),
        }
    }

    fn reject(&mut self, event: HandshakeEvent) -> Result<HandshakeTransition, StateError> {
        let from = self.state;
        if !matches!(from, HandshakeState::Complete) {
            self.state = HandshakeState::Failed;
        }
        Err(StateError::InvalidTransition {
            role: self.role,
            from,
            event,
        })
    }

    fn transition(
        &mut self,
        event: HandshakeEvent,
        next: HandshakeState,
    ) -> Result<HandshakeTransition, StateError> {
        let from = self.state;
        self.state = next;
        Ok(HandshakeTransition {
            from,
            to: next,
            event,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_flow() {
        let mut hs = Handshake::new(Role::Client);
        hs.on_send_header().unwrap();
        hs.on_receive_header().unwrap();
        hs.on_derive_keys().unwrap();
        let t = hs.on_finish().unwrap();
        assert_eq!(t.from, HandshakeState::Derived);
        assert_eq!(hs.state(), HandshakeState::Complete);
    }

    #[test]
    fn test_server_flow() {
        let mut hs = Handshake::new(Role::Server);
        hs.on_receive_header().unwrap();
        hs.on_send_header().unwrap();
        hs.on_derive_keys().unwrap();
        hs.on_finish().unwrap();
        assert_eq!(hs.state(), HandshakeState::Complete);
    }

    #[test]
    fn test_out_of_order_fails() {
        let mut hs = Handshake::new(Role::Server);
        let err = hs.on_send_header().unwrap_err();
        assert_eq!(
            err,
            StateError::InvalidTransition {
                role: Role::Server,
                from: HandshakeState::Idle,
                event: HandshakeEvent::SendHeader,
            }
        );
        assert_eq!(hs.state(), HandshakeState::Failed);
        assert!(hs.on_receive_header().is_err());
    }

    #[test]
    fn test_fail_is_terminal() {
        let mut hs = Handshake::new(Role::Client);
        hs.on_send_header().unwrap();
        let t = hs.on_fail().unwrap();
        assert_eq!(t.from, HandshakeState::Sent);
        assert_eq!(t.to, HandshakeState::Failed);
        assert_eq!(t.event, HandshakeEvent::Fail);
        assert!(hs.on_fail().is_err());
    }

    #[test]
    fn test_complete_is_not_failed_by_late_events() {
        let mut hs = Handshake::new(Role::Client);
        hs.on_send_header().unwrap();
        hs.on_receive_header().unwrap();
        hs.on_derive_keys().unwrap();
        hs.on_finish().unwrap();
        assert!(hs.on_fail().is_err());
        assert_eq!(hs.state(), HandshakeState::Complete);
    }
}
