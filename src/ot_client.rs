//! `OtClient`: the three-plus-two-state machine mediating local edits and
//! remote operations under server acknowledgement (spec.md §4.2).
//!
//! Modeled as a tagged variant matched in a single `apply_client` /
//! `apply_server` / `server_ack` set of methods, per spec.md §9's "Design
//! Notes" guidance to avoid class-per-state in a language without cheap
//! dynamic dispatch. The three collaborator hooks the source injects as
//! callbacks (`sendOperation`, `applyOperation`, `getOperations`) are
//! modeled as a `Collaborators` trait, dependency-injected the way the
//! `rustpad` reference server's `OperationSeq`-based `apply_edit` takes its
//! document/history state by reference rather than reaching for globals.

use crate::error::{CoreError, CoreResult};
use crate::op::TextOperation;

/// Collaborators the FSM calls out to; implemented by `SessionClient` in
/// production and by in-memory fakes in tests.
pub trait Collaborators {
    /// Send `op` to the server as the client's next operation at `revision`.
    fn send_operation(&mut self, revision: u64, op: &TextOperation);
    /// Apply `op` (already transformed against any outstanding/buffered
    /// operation) to the local replica and fan out a `remote` change event.
    fn apply_operation(&mut self, op: &TextOperation);
    /// Request the operations between `base` and `head` after a stale ack.
    fn get_operations(&mut self, base: u64, head: u64);
}

/// The five reachable FSM states (spec.md §3 "OTClient state").
#[derive(Debug, Clone)]
pub enum OtState {
    Synchronized,
    AwaitingConfirm {
        outstanding: TextOperation,
    },
    AwaitingWithBuffer {
        outstanding: TextOperation,
        buffer: TextOperation,
    },
    Stale {
        outstanding: TextOperation,
        target_revision: u64,
    },
    StaleWithBuffer {
        outstanding: TextOperation,
        buffer: TextOperation,
        target_revision: u64,
    },
}

/// The OT client state machine. Owns the current `revision` and state;
/// mutation of the replica happens through the injected `Collaborators`.
pub struct OtClient {
    revision: u64,
    state: OtState,
}

impl OtClient {
    pub fn new(revision: u64) -> Self {
        Self {
            revision,
            state: OtState::Synchronized,
        }
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn state(&self) -> &OtState {
        &self.state
    }

    pub fn is_synchronized(&self) -> bool {
        matches!(self.state, OtState::Synchronized)
    }

    /// A local edit occurred. May send `op` to the transport via
    /// `collaborators.send_operation`.
    pub fn apply_client<C: Collaborators>(
        &mut self,
        op: TextOperation,
        collaborators: &mut C,
    ) -> CoreResult<()> {
        self.state = match std::mem::replace(&mut self.state, OtState::Synchronized) {
            OtState::Synchronized => {
                collaborators.send_operation(self.revision, &op);
                OtState::AwaitingConfirm { outstanding: op }
            }
            OtState::AwaitingConfirm { outstanding } => OtState::AwaitingWithBuffer {
                outstanding,
                buffer: op,
            },
            OtState::AwaitingWithBuffer { outstanding, buffer } => {
                let composed = buffer.compose(&op).map_err(|_| CoreError::TransformLengthMismatch {
                    a_base: buffer.target_length(),
                    b_base: op.base_length(),
                })?;
                OtState::AwaitingWithBuffer {
                    outstanding,
                    buffer: composed,
                }
            }
            stale @ (OtState::Stale { .. } | OtState::StaleWithBuffer { .. }) => {
                self.state = stale;
                return Err(CoreError::Disconnected);
            }
        };
        Ok(())
    }

    /// An inbound remote operation arrived at revision `rev`.
    pub fn apply_server<C: Collaborators>(
        &mut self,
        rev: u64,
        op: TextOperation,
        collaborators: &mut C,
    ) -> CoreResult<()> {
        if rev.saturating_sub(self.revision) > 1 {
            return Err(CoreError::InvalidRevision {
                expected: self.revision + 1,
                got: rev,
            });
        }
        self.state = match std::mem::replace(&mut self.state, OtState::Synchronized) {
            OtState::Synchronized => {
                collaborators.apply_operation(&op);
                self.revision = rev;
                OtState::Synchronized
            }
            OtState::AwaitingConfirm { outstanding } => {
                let (out_prime, op_prime) = outstanding.transform(&op)?;
                collaborators.apply_operation(&op_prime);
                self.revision = rev;
                OtState::AwaitingConfirm {
                    outstanding: out_prime,
                }
            }
            OtState::AwaitingWithBuffer { outstanding, buffer } => {
                let (out_prime, op1) = outstanding.transform(&op)?;
                let (buf_prime, op2) = buffer.transform(&op1)?;
                collaborators.apply_operation(&op2);
                self.revision = rev;
                OtState::AwaitingWithBuffer {
                    outstanding: out_prime,
                    buffer: buf_prime,
                }
            }
            stale @ (OtState::Stale { .. } | OtState::StaleWithBuffer { .. }) => {
                // A normal inbound op cannot arrive while recovering; a
                // revision gap discovered here is fatal per spec.md §4.2.
                self.state = stale;
                return Err(CoreError::InvalidRevision {
                    expected: self.revision + 1,
                    got: rev,
                });
            }
        };
        Ok(())
    }

    /// An ack for our own outstanding operation arrived at revision `rev`.
    pub fn server_ack<C: Collaborators>(&mut self, rev: u64, collaborators: &mut C) -> CoreResult<()> {
        self.state = match std::mem::replace(&mut self.state, OtState::Synchronized) {
            OtState::Synchronized => {
                self.state = OtState::Synchronized;
                return Err(CoreError::NoPendingOperation);
            }
            OtState::AwaitingConfirm { outstanding } => {
                if rev > self.revision + 1 {
                    collaborators.get_operations(self.revision, rev);
                    OtState::Stale {
                        outstanding,
                        target_revision: rev,
                    }
                } else {
                    self.revision = rev;
                    OtState::Synchronized
                }
            }
            OtState::AwaitingWithBuffer { outstanding, buffer } => {
                if rev > self.revision + 1 {
                    collaborators.get_operations(self.revision, rev);
                    OtState::StaleWithBuffer {
                        outstanding,
                        buffer,
                        target_revision: rev,
                    }
                } else {
                    self.revision = rev;
                    collaborators.send_operation(self.revision, &buffer);
                    OtState::AwaitingConfirm { outstanding: buffer }
                }
            }
            stale @ (OtState::Stale { .. } | OtState::StaleWithBuffer { .. }) => {
                self.state = stale;
                return Err(CoreError::NoPendingOperation);
            }
        };
        Ok(())
    }

    /// The missing operations requested during stale recovery have arrived.
    /// `head` is the revision the server had reached when it sent them.
    pub fn apply_operations<C: Collaborators>(
        &mut self,
        head: u64,
        ops: Vec<TextOperation>,
        collaborators: &mut C,
    ) -> CoreResult<()> {
        self.state = match std::mem::replace(&mut self.state, OtState::Synchronized) {
            OtState::Stale {
                mut outstanding,
                target_revision: _,
            } => {
                for server_op in &ops {
                    let (out_prime, op_prime) = outstanding.transform(server_op)?;
                    collaborators.apply_operation(&op_prime);
                    outstanding = out_prime;
                }
                self.revision = head;
                collaborators.send_operation(self.revision, &outstanding);
                OtState::AwaitingConfirm {
                    outstanding,
                }
            }
            OtState::StaleWithBuffer {
                mut outstanding,
                mut buffer,
                target_revision: _,
            } => {
                for server_op in &ops {
                    let (out_prime, op1) = outstanding.transform(server_op)?;
                    let (buf_prime, op2) = buffer.transform(&op1)?;
                    collaborators.apply_operation(&op2);
                    outstanding = out_prime;
                    buffer = buf_prime;
                }
                self.revision = head;
                OtState::AwaitingWithBuffer { outstanding, buffer }
            }
            other => {
                self.state = other;
                return Err(CoreError::InvalidRevision {
                    expected: self.revision,
                    got: head,
                });
            }
        };
        Ok(())
    }

    /// Re-send the outstanding operation (if any) after a transport
    /// reconnect, so it isn't lost in flight.
    pub fn server_reconnect<C: Collaborators>(&mut self, collaborators: &mut C) {
        match &self.state {
            OtState::AwaitingConfirm { outstanding } => {
                collaborators.send_operation(self.revision, outstanding);
            }
            OtState::AwaitingWithBuffer { outstanding, .. } => {
                collaborators.send_operation(self.revision, outstanding);
            }
            _ => {}
        }
    }

    /// Compose successive transforms of the outstanding (and buffer,
    /// if any) operations through a user-supplied selection position, so
    /// cursor visualisation remains valid across local-edit bookkeeping.
    pub fn transform_selection(&self, pos: usize) -> usize {
        match &self.state {
            OtState::Synchronized | OtState::Stale { .. } => pos,
            OtState::AwaitingConfirm { outstanding } => {
                TextOperation::transform_position(pos, outstanding, true)
            }
            OtState::AwaitingWithBuffer { outstanding, buffer }
            | OtState::StaleWithBuffer { outstanding, buffer, .. } => {
                let once = TextOperation::transform_position(pos, outstanding, true);
                TextOperation::transform_position(once, buffer, true)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct FakeCollaborators {
        sent: Vec<(u64, TextOperation)>,
        applied: Vec<TextOperation>,
        fetch_requests: Vec<(u64, u64)>,
    }

    impl Collaborators for FakeCollaborators {
        fn send_operation(&mut self, revision: u64, op: &TextOperation) {
            self.sent.push((revision, op.clone()));
        }
        fn apply_operation(&mut self, op: &TextOperation) {
            self.applied.push(op.clone());
        }
        fn get_operations(&mut self, base: u64, head: u64) {
            self.fetch_requests.push((base, head));
        }
    }

    fn insert_at(pos: usize, s: &str, base_len: usize) -> TextOperation {
        let mut op = TextOperation::new();
        op.retain(pos).insert(s).retain(base_len - pos);
        op
    }

    #[test]
    fn synchronized_to_awaiting_confirm_on_local_edit() {
        let mut fsm = OtClient::new(0);
        let mut collab = FakeCollaborators::default();
        let op = insert_at(0, "a", 0);
        fsm.apply_client(op.clone(), &mut collab).unwrap();
        assert!(!fsm.is_synchronized());
        assert_eq!(collab.sent, vec![(0, op)]);
    }

    #[test]
    fn ack_with_no_outstanding_is_fatal() {
        let mut fsm = OtClient::new(0);
        let mut collab = FakeCollaborators::default();
        assert!(matches!(
            fsm.server_ack(1, &mut collab),
            Err(CoreError::NoPendingOperation)
        ));
    }

    #[test]
    fn full_round_trip_returns_to_synchronized() {
        let mut fsm = OtClient::new(0);
        let mut collab = FakeCollaborators::default();
        fsm.apply_client(insert_at(0, "a", 0), &mut collab).unwrap();
        fsm.server_ack(1, &mut collab).unwrap();
        assert!(fsm.is_synchronized());
        assert_eq!(fsm.revision(), 1);
    }

    #[test]
    fn buffered_edit_sent_on_ack() {
        let mut fsm = OtClient::new(0);
        let mut collab = FakeCollaborators::default();
        fsm.apply_client(insert_at(0, "a", 0), &mut collab).unwrap();
        fsm.apply_client(insert_at(1, "b", 1), &mut collab).unwrap();
        assert!(matches!(fsm.state(), OtState::AwaitingWithBuffer { .. }));
        fsm.server_ack(1, &mut collab).unwrap();
        assert!(matches!(fsm.state(), OtState::AwaitingConfirm { .. }));
        assert_eq!(collab.sent.len(), 2);
        fsm.server_ack(2, &mut collab).unwrap();
        assert!(fsm.is_synchronized());
    }

    #[test]
    fn stale_ack_requests_missing_operations() {
        let mut fsm = OtClient::new(0);
        let mut collab = FakeCollaborators::default();
        fsm.apply_client(insert_at(0, "a", 0), &mut collab).unwrap();
        fsm.server_ack(3, &mut collab).unwrap();
        assert!(matches!(fsm.state(), OtState::Stale { .. }));
        assert_eq!(collab.fetch_requests, vec![(0, 3)]);
    }

    #[test]
    fn scenario_concurrent_insert_same_position() {
        // spec.md §8 scenario 1.
        let mut fsm = OtClient::new(0);
        let mut collab = FakeCollaborators::default();
        let mut replica = "hello world".to_string();

        let local_op = insert_at(5, "X", 11);
        replica = local_op.apply(&replica).unwrap();
        assert_eq!(replica, "helloX world");
        fsm.apply_client(local_op, &mut collab).unwrap();

        let remote_op = insert_at(5, "Y", 11);
        fsm.apply_server(1, remote_op, &mut collab).unwrap();
        let applied = collab.applied.last().unwrap();
        replica = applied.apply(&replica).unwrap();
        assert_eq!(replica, "helloXY world");

        fsm.server_ack(2, &mut collab).unwrap();
        assert!(fsm.is_synchronized());
        assert_eq!(replica, "helloXY world");
    }

    #[test]
    fn invalid_revision_gap_is_fatal_outside_ack() {
        let mut fsm = OtClient::new(0);
        let mut collab = FakeCollaborators::default();
        let op = insert_at(0, "x", 0);
        assert!(matches!(
            fsm.apply_server(5, op, &mut collab),
            Err(CoreError::InvalidRevision { .. })
        ));
    }
}
