// Argument handling
//
// Options arrive as `-name=value` tokens. Every option is validated
// eagerly; an unrecognized name or a bad value is a configuration error
// and the caller must abort before launching anything.

use crate::error::{HarnessError, HarnessResult};
use crate::event::EventTag;
use std::collections::HashSet;
use std::time::Duration;

/// JCK-style exit status: base plus a pass/fail offset.
pub const STATUS_BASE: i32 = 95;
pub const STATUS_PASSED: i32 = 0;
pub const STATUS_FAILED: i32 = 2;

pub fn exit_status(passed: bool) -> i32 {
    if passed {
        STATUS_BASE + STATUS_PASSED
    } else {
        STATUS_BASE + STATUS_FAILED
    }
}

/// Verbosity of protocol-level tracing (`-jdi.trace=`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceLevel {
    None,
    Events,
    All,
}

impl TraceLevel {
    fn parse(value: &str) -> HarnessResult<Self> {
        match value {
            "none" => Ok(Self::None),
            "events" => Ok(Self::Events),
            "all" => Ok(Self::All),
            other => Err(HarnessError::Config(format!(
                "bad -jdi.trace value {:?} (expected none, events or all)",
                other
            ))),
        }
    }

    /// Directive for the tracing env filter.
    pub fn filter_directive(self) -> &'static str {
        match self {
            Self::None => "info",
            Self::Events => "info,harness_core=debug",
            Self::All => "trace",
        }
    }
}

/// Which events may be left over after correlation without failing the
/// run (`-allowExtraEvents=` / `-allowMissedEvents=`). The value is either
/// `all` or a comma-separated list of event type names.
fn parse_allow_list(option: &str, value: &str) -> HarnessResult<HashSet<EventTag>> {
    if value == "all" {
        return Ok(EventTag::ALL
            .iter()
            .copied()
            .filter(|tag| tag.is_correlatable())
            .collect());
    }
    parse_tag_list(option, value)
}

fn parse_tag_list(option: &str, value: &str) -> HarnessResult<HashSet<EventTag>> {
    let mut tags = HashSet::new();
    for name in value.split(',').filter(|name| !name.is_empty()) {
        let tag: EventTag = name
            .parse()
            .map_err(|e| HarnessError::Config(format!("bad {} value: {}", option, e)))?;
        tags.insert(tag);
    }
    Ok(tags)
}

#[derive(Debug, Clone)]
pub struct HarnessOptions {
    /// Only the launching connector is implemented; the option is
    /// validated so misconfigured invocations fail fast.
    pub connector: String,
    pub transport: String,
    pub trace_level: TraceLevel,
    /// Event types the scenario monitors and correlates.
    pub event_tags: Vec<EventTag>,
    /// Path of the debuggee binary to launch.
    pub debuggee_path: String,
    pub allow_extra: HashSet<EventTag>,
    pub allow_missed: HashSet<EventTag>,
    /// Actions each worker performs.
    pub events_number: u32,
    /// Worker threads the debuggee creates.
    pub threads_number: u32,
    /// Per-phase waiting budget, given in minutes.
    pub wait_time: Duration,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            connector: "launching".to_string(),
            transport: "socket".to_string(),
            trace_level: TraceLevel::None,
            event_tags: Vec::new(),
            debuggee_path: String::new(),
            allow_extra: HashSet::new(),
            allow_missed: HashSet::new(),
            events_number: 1,
            threads_number: 1,
            wait_time: Duration::from_secs(2 * 60),
        }
    }
}

impl HarnessOptions {
    /// Parse command-line tokens. `args` excludes the program name.
    pub fn parse<I, S>(args: I) -> HarnessResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut options = Self::default();
        for arg in args {
            let arg = arg.as_ref();
            let (name, value) = split_option(arg)?;
            match name {
                "connector" => {
                    if value != "launching" && value != "default" {
                        return Err(HarnessError::Config(format!(
                            "unsupported connector {:?} (only launching is available)",
                            value
                        )));
                    }
                    options.connector = "launching".to_string();
                }
                "transport" => {
                    if value != "socket" {
                        return Err(HarnessError::Config(format!(
                            "unsupported transport {:?} (only socket is available)",
                            value
                        )));
                    }
                    options.transport = value.to_string();
                }
                "jdi.trace" => options.trace_level = TraceLevel::parse(value)?,
                "eventType" => {
                    let tags = parse_tag_list("-eventType", value)?;
                    if tags.is_empty() {
                        return Err(HarnessError::Config(
                            "-eventType lists no event types".to_string(),
                        ));
                    }
                    // Keep the order given on the command line.
                    options.event_tags = value
                        .split(',')
                        .filter(|name| !name.is_empty())
                        .map(str::parse)
                        .collect::<HarnessResult<Vec<_>>>()?;
                }
                "debuggeeClassName" => options.debuggee_path = value.to_string(),
                "allowExtraEvents" => {
                    options.allow_extra = parse_allow_list("-allowExtraEvents", value)?
                }
                "allowMissedEvents" => {
                    options.allow_missed = parse_allow_list("-allowMissedEvents", value)?
                }
                "eventsNumber" => {
                    options.events_number = parse_number("-eventsNumber", value)?
                }
                "threadsNumber" => {
                    options.threads_number = parse_number("-threadsNumber", value)?
                }
                "waitTime" => {
                    let minutes: u64 = value.parse().map_err(|_| {
                        HarnessError::Config(format!("bad -waitTime value {:?}", value))
                    })?;
                    if minutes == 0 {
                        return Err(HarnessError::Config(
                            "-waitTime must be at least one minute".to_string(),
                        ));
                    }
                    let seconds = minutes.checked_mul(60).ok_or_else(|| {
                        HarnessError::Config(format!(
                            "-waitTime value {} is out of range",
                            minutes
                        ))
                    })?;
                    options.wait_time = Duration::from_secs(seconds);
                }
                other => {
                    return Err(HarnessError::Config(format!(
                        "unrecognized option -{}",
                        other
                    )))
                }
            }
        }
        Ok(options)
    }
}

fn split_option(arg: &str) -> HarnessResult<(&str, &str)> {
    let body = arg
        .strip_prefix('-')
        .ok_or_else(|| HarnessError::Config(format!("malformed option {:?}", arg)))?;
    body.split_once('=')
        .ok_or_else(|| HarnessError::Config(format!("option {:?} is missing =value", arg)))
}

fn parse_number(option: &str, value: &str) -> HarnessResult<u32> {
    let number: u32 = value
        .parse()
        .map_err(|_| HarnessError::Config(format!("bad {} value {:?}", option, value)))?;
    if number == 0 {
        return Err(HarnessError::Config(format!(
            "{} must be positive",
            option
        )));
    }
    Ok(number)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_command_line_parses() {
        let options = HarnessOptions::parse([
            "-connector=launching",
            "-transport=socket",
            "-jdi.trace=events",
            "-eventType=monitor-contended-enter,monitor-contended-entered",
            "-debuggeeClassName=target/debug/debuggee",
            "-allowExtraEvents=monitor-wait",
            "-allowMissedEvents=all",
            "-eventsNumber=3",
            "-threadsNumber=5",
            "-waitTime=2",
        ])
        .unwrap();

        assert_eq!(
            options.event_tags,
            vec![
                EventTag::MonitorContendedEnter,
                EventTag::MonitorContendedEntered
            ]
        );
        assert_eq!(options.trace_level, TraceLevel::Events);
        assert_eq!(options.debuggee_path, "target/debug/debuggee");
        assert!(options.allow_extra.contains(&EventTag::MonitorWait));
        assert!(options.allow_missed.contains(&EventTag::MonitorWaited));
        assert!(!options.allow_missed.contains(&EventTag::VmStart));
        assert_eq!(options.events_number, 3);
        assert_eq!(options.threads_number, 5);
        assert_eq!(options.wait_time, Duration::from_secs(120));
    }

    #[test]
    fn unrecognized_option_is_a_configuration_error() {
        let err = HarnessOptions::parse(["-frobnicate=yes"]).unwrap_err();
        assert!(err.is_test_bug(), "got {:?}", err);
        assert!(err.to_string().contains("frobnicate"));
    }

    #[test]
    fn malformed_tokens_are_rejected() {
        assert!(HarnessOptions::parse(["eventsNumber=3"]).is_err());
        assert!(HarnessOptions::parse(["-eventsNumber"]).is_err());
        assert!(HarnessOptions::parse(["-eventsNumber=zero"]).is_err());
        assert!(HarnessOptions::parse(["-eventsNumber=0"]).is_err());
        assert!(HarnessOptions::parse(["-waitTime=0"]).is_err());
        // Overflows the seconds conversion.
        assert!(HarnessOptions::parse(["-waitTime=400000000000000000"]).is_err());
        assert!(HarnessOptions::parse(["-eventType=no-such-event"]).is_err());
        assert!(HarnessOptions::parse(["-transport=shmem"]).is_err());
        assert!(HarnessOptions::parse(["-connector=attaching"]).is_err());
        assert!(HarnessOptions::parse(["-jdi.trace=verbose"]).is_err());
    }

    #[test]
    fn defaults_apply_when_options_are_omitted() {
        let options = HarnessOptions::parse(Vec::<String>::new()).unwrap();
        assert_eq!(options.connector, "launching");
        assert_eq!(options.transport, "socket");
        assert_eq!(options.trace_level, TraceLevel::None);
        assert_eq!(options.events_number, 1);
        assert_eq!(options.threads_number, 1);
        assert_eq!(options.wait_time, Duration::from_secs(120));
    }

    #[test]
    fn exit_status_offsets_from_the_base() {
        assert_eq!(exit_status(true), 95);
        assert_eq!(exit_status(false), 97);
    }
}
