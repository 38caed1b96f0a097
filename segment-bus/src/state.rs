//! Reader lifecycle as a transition table.

use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReaderState {
    Ready,
    Opening,
    Opened,
    Playing,
    Paused,
    Done,
    /// Open failed. Terminal.
    Error,
}

impl Display for ReaderState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ReaderState::Ready => "ready",
            ReaderState::Opening => "opening",
            ReaderState::Opened => "opened",
            ReaderState::Playing => "playing",
            ReaderState::Paused => "paused",
            ReaderState::Done => "done",
            ReaderState::Error => "error",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    Open,
    OpenSuccess,
    OpenError(String),
    Play,
    Pause,
    Reset,
    Eof,
    ReadError(String),
}

/// Notification delivered to reader observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaderEvent {
    Error(String),
    Eof,
    Reset,
    Shutdown,
}

/// Side effect dispatched after a transition is applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Action {
    None,
    /// Start the pump thread.
    Start,
    /// Unpark a paused pump.
    Resume,
    /// Close the source, drop every stream and notify.
    Teardown(ReaderEvent),
    /// Open failed; notify and refuse everything from now on.
    Halt(String),
}

/// Looks up the transition for `trigger` in `state`. `None` means the event
/// is not accepted in that state.
pub(crate) fn next(state: ReaderState, trigger: &Trigger) -> Option<(ReaderState, Action)> {
    use ReaderState::*;

    let entry = match (state, trigger) {
        (Ready | Done, Trigger::Open) => (Opening, Action::None),
        (Opening, Trigger::OpenSuccess) => (Opened, Action::None),
        (Opening, Trigger::OpenError(msg)) => (Error, Action::Halt(msg.clone())),
        (Opened, Trigger::Play) => (Playing, Action::Start),
        (Playing, Trigger::Pause) => (Paused, Action::None),
        (Paused, Trigger::Play) => (Playing, Action::Resume),
        (Paused, Trigger::Pause) => (Paused, Action::None),
        (Playing | Paused, Trigger::Eof) => (Done, Action::Teardown(ReaderEvent::Eof)),
        (Playing | Paused, Trigger::ReadError(msg)) => {
            (Done, Action::Teardown(ReaderEvent::Error(msg.clone())))
        }
        (Opened | Playing | Paused, Trigger::Reset) => {
            (Done, Action::Teardown(ReaderEvent::Reset))
        }
        _ => return None,
    };
    Some(entry)
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATES: [ReaderState; 7] = [
        ReaderState::Ready,
        ReaderState::Opening,
        ReaderState::Opened,
        ReaderState::Playing,
        ReaderState::Paused,
        ReaderState::Done,
        ReaderState::Error,
    ];

    fn triggers() -> Vec<Trigger> {
        vec![
            Trigger::Open,
            Trigger::OpenSuccess,
            Trigger::OpenError("x".into()),
            Trigger::Play,
            Trigger::Pause,
            Trigger::Reset,
            Trigger::Eof,
            Trigger::ReadError("y".into()),
        ]
    }

    #[test]
    fn test_error_state_is_terminal() {
        for trigger in triggers() {
            assert_eq!(next(ReaderState::Error, &trigger), None, "{trigger:?}");
        }
    }

    #[test]
    fn test_happy_path() {
        let mut state = ReaderState::Ready;
        for trigger in [
            Trigger::Open,
            Trigger::OpenSuccess,
            Trigger::Play,
            Trigger::Pause,
            Trigger::Play,
            Trigger::Eof,
            Trigger::Open,
        ] {
            state = next(state, &trigger).unwrap().0;
        }
        assert_eq!(state, ReaderState::Opening);
    }

    #[test]
    fn test_reset_reaches_done() {
        for state in [ReaderState::Opened, ReaderState::Playing, ReaderState::Paused] {
            let (to, action) = next(state, &Trigger::Reset).unwrap();
            assert_eq!(to, ReaderState::Done);
            assert_eq!(action, Action::Teardown(ReaderEvent::Reset));
        }
        assert_eq!(
            next(ReaderState::Done, &Trigger::Open).unwrap().0,
            ReaderState::Opening
        );
    }

    #[test]
    fn test_open_error_halts() {
        let (to, action) = next(ReaderState::Opening, &Trigger::OpenError("404".into())).unwrap();
        assert_eq!(to, ReaderState::Error);
        assert_eq!(action, Action::Halt("404".into()));
    }

    #[test]
    fn test_pause_while_paused_stays_paused() {
        assert_eq!(
            next(ReaderState::Paused, &Trigger::Pause),
            Some((ReaderState::Paused, Action::None))
        );
        assert_eq!(
            next(ReaderState::Paused, &Trigger::Play),
            Some((ReaderState::Playing, Action::Resume))
        );
    }

    #[test]
    fn test_read_error_is_not_eof() {
        let (to, action) = next(ReaderState::Playing, &Trigger::ReadError("EIO".into())).unwrap();
        assert_eq!(to, ReaderState::Done);
        assert_eq!(action, Action::Teardown(ReaderEvent::Error("EIO".into())));
    }

    #[test]
    fn test_only_listed_transitions_are_accepted() {
        let accepted: usize = STATES
            .iter()
            .map(|state| {
                triggers()
                    .iter()
                    .filter(|t| next(*state, t).is_some())
                    .count()
            })
            .sum();
        // open x2, open success, open error, play x2, pause x2, eof x2,
        // read error x2, reset x3
        assert_eq!(accepted, 15);
        assert_eq!(next(ReaderState::Ready, &Trigger::Play), None);
        assert_eq!(next(ReaderState::Playing, &Trigger::Open), None);
    }
}
