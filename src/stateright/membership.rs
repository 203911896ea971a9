//! Stateright model of the membership bootstrap state machine
//!
//! Abstracts `MembershipCoordinator::join`: discovery produces candidates,
//! handshake rounds consume them, and the fallback rules decide between a
//! cluster of one and `JoinFailed`. All three discovery modes start as
//! separate initial states.
//!
//! Properties:
//! - GATE_IFF_JOINED: the readiness gate is open exactly when Joined
//! - STATIC_NEVER_ALONE: a static bootstrap only runs alone when the
//!   bootstrap address turned out to be this node
//! - FAILURE_HAS_CAUSE: JoinFailed comes from an unreachable static peer,
//!   exhausted DNS resolution or cancellation
//! - ATTEMPTS_BOUNDED: handshake rounds and resolver attempts stay within
//!   the configured limit

use stateright::{Model, Property};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Mode {
    Static,
    Dns,
    Default,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    Unjoined,
    Discovering,
    Joining,
    Joined,
    JoinFailed,
}

impl Phase {
    fn is_terminal(self) -> bool {
        matches!(self, Phase::Joined | Phase::JoinFailed)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MembershipModelState {
    pub mode: Mode,
    pub phase: Phase,
    pub gate_open: bool,
    /// Candidates still worth a handshake
    pub candidates: u8,
    pub rounds: u32,
    pub resolve_failures: u32,
    pub saw_self: bool,
    pub joined_peer: bool,
    pub cancelled: bool,
}

impl MembershipModelState {
    fn new(mode: Mode) -> Self {
        MembershipModelState {
            mode,
            phase: Phase::Unjoined,
            gate_open: false,
            candidates: 0,
            rounds: 0,
            resolve_failures: 0,
            saw_self: false,
            joined_peer: false,
            cancelled: false,
        }
    }

    fn alone(&self) -> bool {
        self.phase == Phase::Joined && !self.joined_peer
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum MembershipAction {
    StartDiscovery,
    /// Static/Default: the configured address is the single candidate
    UseBootstrapAddress,
    Resolved { addresses: u8 },
    ResolveFailed,
    HandshakeAccepted,
    HandshakeSelf,
    /// Every remaining candidate failed this round
    RoundFailed,
    Cancel,
}

pub struct MembershipModel {
    pub join_attempts: u32,
    pub max_addresses: u8,
}

impl MembershipModel {
    pub fn new() -> Self {
        MembershipModel {
            join_attempts: 3,
            max_addresses: 2,
        }
    }

    /// Leave Joining once candidates or rounds run out
    fn settle(&self, state: &mut MembershipModelState) {
        if state.phase != Phase::Joining {
            return;
        }
        let out_of_rounds = state.rounds >= self.join_attempts;
        if state.candidates == 0 {
            state.phase = Phase::Joined;
            state.gate_open = true;
        } else if out_of_rounds {
            if state.mode == Mode::Static {
                state.phase = Phase::JoinFailed;
            } else {
                state.phase = Phase::Joined;
                state.gate_open = true;
            }
        }
    }
}

impl Default for MembershipModel {
    fn default() -> Self {
        Self::new()
    }
}

impl Model for MembershipModel {
    type State = MembershipModelState;
    type Action = MembershipAction;

    fn init_states(&self) -> Vec<Self::State> {
        vec![
            MembershipModelState::new(Mode::Static),
            MembershipModelState::new(Mode::Dns),
            MembershipModelState::new(Mode::Default),
        ]
    }

    fn actions(&self, state: &Self::State, actions: &mut Vec<Self::Action>) {
        if state.phase.is_terminal() {
            return;
        }
        actions.push(MembershipAction::Cancel);

        match state.phase {
            Phase::Unjoined => actions.push(MembershipAction::StartDiscovery),
            Phase::Discovering => match state.mode {
                Mode::Static | Mode::Default => actions.push(MembershipAction::UseBootstrapAddress),
                Mode::Dns => {
                    for addresses in 0..=self.max_addresses {
                        actions.push(MembershipAction::Resolved { addresses });
                    }
                    actions.push(MembershipAction::ResolveFailed);
                }
            },
            Phase::Joining => {
                actions.push(MembershipAction::HandshakeAccepted);
                // At most one candidate can be this node
                if !state.saw_self {
                    actions.push(MembershipAction::HandshakeSelf);
                }
                actions.push(MembershipAction::RoundFailed);
            }
            Phase::Joined | Phase::JoinFailed => {}
        }
    }

    fn next_state(&self, state: &Self::State, action: Self::Action) -> Option<Self::State> {
        let mut next = state.clone();
        match action {
            MembershipAction::Cancel => {
                next.cancelled = true;
                next.phase = Phase::JoinFailed;
            }
            MembershipAction::StartDiscovery => next.phase = Phase::Discovering,
            MembershipAction::UseBootstrapAddress => {
                next.candidates = 1;
                next.phase = Phase::Joining;
            }
            MembershipAction::Resolved { addresses } => {
                next.candidates = addresses;
                next.phase = Phase::Joining;
            }
            MembershipAction::ResolveFailed => {
                next.resolve_failures += 1;
                if next.resolve_failures >= self.join_attempts {
                    next.phase = Phase::JoinFailed;
                }
            }
            MembershipAction::HandshakeAccepted => {
                next.joined_peer = true;
                next.phase = Phase::Joined;
                next.gate_open = true;
            }
            MembershipAction::HandshakeSelf => {
                next.saw_self = true;
                next.candidates = next.candidates.checked_sub(1)?;
            }
            MembershipAction::RoundFailed => next.rounds += 1,
        }
        self.settle(&mut next);
        Some(next)
    }

    fn properties(&self) -> Vec<Property<Self>> {
        vec![
            Property::always("gate_iff_joined", |_: &MembershipModel, s: &MembershipModelState| {
                s.gate_open == (s.phase == Phase::Joined)
            }),
            Property::always("static_never_alone", |_: &MembershipModel, s: &MembershipModelState| {
                !(s.mode == Mode::Static && s.alone()) || s.saw_self
            }),
            Property::always("failure_has_cause", |m: &MembershipModel, s: &MembershipModelState| {
                s.phase != Phase::JoinFailed
                    || s.cancelled
                    || s.mode == Mode::Static
                    || s.resolve_failures >= m.join_attempts
            }),
            Property::always("attempts_bounded", |m: &MembershipModel, s: &MembershipModelState| {
                s.rounds <= m.join_attempts && s.resolve_failures <= m.join_attempts
            }),
            Property::sometimes("dns_first_member_alone", |_: &MembershipModel, s: &MembershipModelState| {
                s.mode == Mode::Dns && s.alone() && !s.saw_self
            }),
            Property::sometimes("static_join_fails", |_: &MembershipModel, s: &MembershipModelState| {
                s.mode == Mode::Static && s.phase == Phase::JoinFailed && !s.cancelled
            }),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(model: &MembershipModel, mode: Mode, actions: &[MembershipAction]) -> MembershipModelState {
        let mut state = MembershipModelState::new(mode);
        for action in actions {
            state = model.next_state(&state, action.clone()).unwrap();
        }
        state
    }

    #[test]
    fn test_dns_zero_addresses_is_cluster_of_one() {
        let model = MembershipModel::new();
        let state = run(
            &model,
            Mode::Dns,
            &[
                MembershipAction::StartDiscovery,
                MembershipAction::Resolved { addresses: 0 },
            ],
        );
        assert_eq!(state.phase, Phase::Joined);
        assert!(state.gate_open);
        assert!(state.alone());
    }

    #[test]
    fn test_default_self_bootstrap_is_cluster_of_one() {
        let model = MembershipModel::new();
        let state = run(
            &model,
            Mode::Default,
            &[
                MembershipAction::StartDiscovery,
                MembershipAction::UseBootstrapAddress,
                MembershipAction::HandshakeSelf,
            ],
        );
        assert_eq!(state.phase, Phase::Joined);
    }

    #[test]
    fn test_static_unreachable_fails_after_rounds() {
        let model = MembershipModel::new();
        let state = run(
            &model,
            Mode::Static,
            &[
                MembershipAction::StartDiscovery,
                MembershipAction::UseBootstrapAddress,
                MembershipAction::RoundFailed,
                MembershipAction::RoundFailed,
                MembershipAction::RoundFailed,
            ],
        );
        assert_eq!(state.phase, Phase::JoinFailed);
        assert!(!state.gate_open);
    }

    #[test]
    #[ignore] // Run with: cargo test stateright_membership -- --ignored --nocapture
    fn stateright_membership_model_check() {
        use stateright::Checker;

        let model = MembershipModel::new();
        let checker = model.checker().spawn_bfs().join();
        println!("States explored: {}", checker.unique_state_count());
        checker.assert_properties();
    }
}
