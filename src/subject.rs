//! Pipe naming.
//!
//! Maps a pipe name and mode to the subjects both ends use on the wire. The
//! mapping is a pure function: two processes that agree on the name and the
//! mode compute identical subjects without any coordination.
//!
//! | Mode     | Data subject          | Discover subject        | Group  |
//! |----------|-----------------------|-------------------------|--------|
//! | Direct   | `pipe.<name>`         | -                       | -      |
//! | Group    | `pipe.<name>`         | -                       | `pipe` |
//! | Discover | per listener inbox    | `pipe.<name>.discover`  | `pipe` |
//! | Durable  | `pipe.ASYNC.<name>`   | -                       | -      |

use std::fmt;

use crate::{PipeError, Result, Subject};

/// Root token of every pipe subject.
pub const SUBJECT_PREFIX: &str = "pipe";

/// Namespace token segregating durable traffic.
pub const ASYNC_TOKEN: &str = "ASYNC";

/// Queue group shared by group listeners and discovery listeners.
pub const GROUP_NAME: &str = "pipe";

/// Name of the durable work-queue stream.
pub const STREAM_NAME: &str = "PIPER";

/// Delivery mode of a pipe.
///
/// The mode is picked once, when the [`Pipe`] is built, and drives both the
/// subject layout and the payload framing on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    /// One subscriber, one message, first come wins.
    Direct,

    /// Work shared among a queue group; one member wins each message.
    Group,

    /// Listener hands out a private one-time subject through a handshake.
    Discover,

    /// Persistent work queue; survives listener absence, at-least-once.
    Durable,
}

impl Mode {
    /// Whether payloads in this mode are gzip framed.
    ///
    /// Discovery pipes carry the raw text. Both ends decide this statically;
    /// nothing on the wire says so.
    pub fn compressed(self) -> bool {
        // ---
        match self {
            Mode::Direct | Mode::Group | Mode::Durable => true,
            Mode::Discover => false,
        }
    }

    /// Whether the listener replies to the sender before delivering.
    pub fn uses_request_reply(self) -> bool {
        !matches!(self, Mode::Durable)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Mode::Direct => "direct",
            Mode::Group => "group",
            Mode::Discover => "discover",
            Mode::Durable => "durable",
        };
        f.write_str(s)
    }
}

/// Wire subjects of a pipe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subjects {
    /// Fixed data subject. `None` in discover mode, where the listener
    /// generates it per instance.
    pub data: Option<Subject>,

    /// Subject discovery requests are sent to.
    pub discover: Option<Subject>,

    /// Queue group used on the subscribing side.
    pub group: Option<&'static str>,
}

/// Compute the subjects for `name` in `mode`.
///
/// `name` is expected to be validated already; see [`Pipe::new`].
pub fn subjects(name: &str, mode: Mode) -> Subjects {
    // ---
    match mode {
        Mode::Direct => Subjects {
            data: Some(data_subject(name)),
            discover: None,
            group: None,
        },
        Mode::Group => Subjects {
            data: Some(data_subject(name)),
            discover: None,
            group: Some(GROUP_NAME),
        },
        Mode::Discover => Subjects {
            data: None,
            discover: Some(Subject::from(format!("{SUBJECT_PREFIX}.{name}.discover"))),
            group: Some(GROUP_NAME),
        },
        Mode::Durable => Subjects {
            data: Some(durable_subject(name)),
            discover: None,
            group: None,
        },
    }
}

/// Data subject of a direct or group pipe.
pub fn data_subject(name: &str) -> Subject {
    Subject::from(format!("{SUBJECT_PREFIX}.{name}"))
}

/// Data subject of a durable pipe.
pub fn durable_subject(name: &str) -> Subject {
    Subject::from(format!("{SUBJECT_PREFIX}.{ASYNC_TOKEN}.{name}"))
}

/// Subject filter captured by the durable stream.
pub fn durable_wildcard() -> String {
    format!("{SUBJECT_PREFIX}.{ASYNC_TOKEN}.>")
}

/// A named pipe in a given mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pipe {
    name: String,
    mode: Mode,
    subjects: Subjects,
}

impl Pipe {
    /// Create a pipe.
    ///
    /// # Errors
    ///
    /// Returns [`PipeError::InvalidPipe`] when `name` is empty or contains
    /// whitespace, a `.` or a subject wildcard. A name is always exactly one
    /// subject token and a valid durable consumer name.
    pub fn new(name: impl Into<String>, mode: Mode) -> Result<Self> {
        // ---
        let name = name.into();

        if name.is_empty() {
            return Err(PipeError::InvalidPipe("pipe name must not be empty".into()));
        }

        if name
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '.' | '*' | '>'))
        {
            return Err(PipeError::InvalidPipe(format!(
                "pipe name {name:?} must not contain whitespace, '.', '*' or '>'"
            )));
        }

        let subjects = subjects(&name, mode);
        Ok(Self {
            name,
            mode,
            subjects,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn subjects(&self) -> &Subjects {
        &self.subjects
    }
}

impl fmt::Display for Pipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.mode)
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_direct_and_group_share_data_subject() {
        // ---
        let direct = subjects("x", Mode::Direct);
        let group = subjects("x", Mode::Group);

        assert_eq!(direct.data, Some(Subject::from("pipe.x")));
        assert_eq!(direct.data, group.data);
        assert_eq!(direct.group, None);
        assert_eq!(group.group, Some("pipe"));
    }

    #[test]
    fn test_discover_subjects() {
        // ---
        let s = subjects("build-42", Mode::Discover);

        assert_eq!(s.data, None);
        assert_eq!(s.discover, Some(Subject::from("pipe.build-42.discover")));
        assert_eq!(s.group, Some("pipe"));
    }

    #[test]
    fn test_durable_subject_is_namespaced() {
        // ---
        let s = subjects("jobs", Mode::Durable);

        assert_eq!(s.data, Some(Subject::from("pipe.ASYNC.jobs")));
        assert_eq!(s.discover, None);
        assert_eq!(durable_wildcard(), "pipe.ASYNC.>");
    }

    #[test]
    fn test_subjects_are_deterministic() {
        // ---
        for mode in [Mode::Direct, Mode::Group, Mode::Discover, Mode::Durable] {
            assert_eq!(subjects("same", mode), subjects("same", mode));
        }
    }

    #[test]
    fn test_pipe_rejects_bad_names() {
        // ---
        assert!(matches!(
            Pipe::new("", Mode::Direct),
            Err(PipeError::InvalidPipe(_))
        ));
        assert!(Pipe::new("a b", Mode::Direct).is_err());
        assert!(Pipe::new("a.>", Mode::Durable).is_err());
        assert!(Pipe::new("a.*", Mode::Group).is_err());

        // single-shot pipes must not land in the durable stream
        assert!(matches!(
            Pipe::new("ASYNC.jobs", Mode::Direct),
            Err(PipeError::InvalidPipe(_))
        ));
        assert!(Pipe::new("ASYNC.jobs", Mode::Group).is_err());
        // consumer names are a single token
        assert!(Pipe::new("a.b", Mode::Durable).is_err());

        let pipe = Pipe::new("ok", Mode::Group).unwrap();
        assert_eq!(pipe.name(), "ok");
        assert_eq!(pipe.mode(), Mode::Group);
    }

    #[test]
    fn test_compression_rule_per_mode() {
        // ---
        assert!(Mode::Direct.compressed());
        assert!(Mode::Group.compressed());
        assert!(Mode::Durable.compressed());
        assert!(!Mode::Discover.compressed());
    }
}
