//! Line-oriented AMI framing: headers of the form `Key: Value`, terminated
//! by a blank line or, for `COMMAND` action responses, the literal
//! `--END COMMAND--` sentinel line.

const END_COMMAND_SENTINEL: &str = "--END COMMAND--";

/// A single parsed AMI frame: an ordered list of `Key: Value` headers plus
/// any free-form lines that didn't parse as a header (command output).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub headers: Vec<(String, String)>,
    pub raw_lines: Vec<String>,
}

impl Message {
    /// Case-insensitive lookup of the first header with the given key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// Sets (or appends) a header, used by event normalization to
    /// synthesize legacy keys before the rest of the pipeline runs.
    pub fn set(&mut self, key: &str, value: String) {
        if let Some(existing) = self
            .headers
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
        {
            existing.1 = value;
        } else {
            self.headers.push((key.to_string(), value));
        }
    }

    pub fn event(&self) -> Option<&str> {
        self.get("Event")
    }

    pub fn is_banner(&self, line: &str) -> bool {
        line.starts_with("Asterisk Call Manager")
    }
}

/// Accumulates lines into complete `Message` frames.
///
/// A frame ends on a blank line, or on the `--END COMMAND--` sentinel when
/// a `COMMAND` response is in progress (lines before the sentinel are kept
/// verbatim in `raw_lines` rather than parsed as headers, since command
/// output is free-form).
#[derive(Debug, Default)]
pub struct FrameAccumulator {
    current: Message,
    in_command_output: bool,
}

pub enum FeedResult {
    /// The line completed a frame.
    Complete(Message),
    /// The line was consumed; no complete frame yet.
    Pending,
    /// The line was an AMI banner line, delivered standalone.
    Banner,
}

impl FrameAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, line: &str) -> FeedResult {
        if self.current.headers.is_empty() && self.current.raw_lines.is_empty() {
            if line.starts_with("Asterisk Call Manager") {
                return FeedResult::Banner;
            }
        }

        if line.trim().is_empty() {
            if self.current.headers.is_empty() && self.current.raw_lines.is_empty() {
                return FeedResult::Pending;
            }
            return FeedResult::Complete(self.take());
        }

        if line == END_COMMAND_SENTINEL {
            self.in_command_output = false;
            return FeedResult::Complete(self.take());
        }

        if self.in_command_output {
            self.current.raw_lines.push(line.to_string());
            return FeedResult::Pending;
        }

        match split_header(line) {
            Some((key, value)) => {
                if key.eq_ignore_ascii_case("Response") && value.eq_ignore_ascii_case("Follows") {
                    self.in_command_output = true;
                }
                self.current.headers.push((key.to_string(), value.to_string()));
            }
            None => {
                self.current.raw_lines.push(line.to_string());
            }
        }

        FeedResult::Pending
    }

    fn take(&mut self) -> Message {
        std::mem::take(&mut self.current)
    }
}

fn split_header(line: &str) -> Option<(&str, &str)> {
    let idx = line.find(':')?;
    let key = line[..idx].trim();
    if key.is_empty() {
        return None;
    }
    let value = line[idx + 1..].trim();
    Some((key, value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulates_header_frame_terminated_by_blank_line() {
        let mut acc = FrameAccumulator::new();
        assert!(matches!(acc.feed("Event: RPT_LINKS"), FeedResult::Pending));
        assert!(matches!(acc.feed("Node: 594950"), FeedResult::Pending));
        match acc.feed("") {
            FeedResult::Complete(msg) => {
                assert_eq!(msg.get("Event"), Some("RPT_LINKS"));
                assert_eq!(msg.get("Node"), Some("594950"));
            }
            _ => panic!("expected complete frame"),
        }
    }

    #[test]
    fn command_output_ends_on_sentinel_not_blank_line() {
        let mut acc = FrameAccumulator::new();
        assert!(matches!(acc.feed("Response: Follows"), FeedResult::Pending));
        assert!(matches!(acc.feed("Conn: 588841 (no-ip) RPT_RXKEYED"), FeedResult::Pending));
        match acc.feed("--END COMMAND--") {
            FeedResult::Complete(msg) => {
                assert_eq!(msg.raw_lines, vec!["Conn: 588841 (no-ip) RPT_RXKEYED".to_string()]);
            }
            _ => panic!("expected complete frame"),
        }
    }

    #[test]
    fn banner_line_is_its_own_standalone_signal() {
        let mut acc = FrameAccumulator::new();
        assert!(matches!(
            acc.feed("Asterisk Call Manager/1.1"),
            FeedResult::Banner
        ));
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let mut msg = Message::default();
        msg.set("Event", "FullyBooted".into());
        assert_eq!(msg.get("event"), Some("FullyBooted"));
    }
}
