//! TLCP text protocol: line parsing and MERGE-mode field decoding.
//!
//! Every server message is one CRLF-terminated line of comma-separated
//! fields, tag first. Update payloads are `|`-separated field values where
//!
//! - empty means unchanged since the previous update
//! - `#` means null
//! - `$` means the empty string
//! - `^N` means the next N fields are unchanged
//! - anything else is a percent-encoded value

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

use crate::error::TransportError;

pub const PROTOCOL_VERSION: &str = "TLCP-2.1.0";

/// Characters left alone in form parameters.
const FORM_VALUE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'*');

/// A parsed server line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    ConOk {
        session_id: String,
        /// `None` when the server answers `*` (use the same host)
        control_link: Option<String>,
    },
    ConErr {
        code: i64,
        message: String,
    },
    SubOk {
        sub_id: u64,
        items: usize,
        fields: usize,
    },
    Update {
        sub_id: u64,
        item: u64,
        payload: String,
    },
    EndOfSnapshot {
        sub_id: u64,
    },
    ClearSnapshot {
        sub_id: u64,
    },
    ReqOk {
        req_id: u64,
    },
    ReqErr {
        req_id: u64,
        code: i64,
        message: String,
    },
    Error {
        code: i64,
        message: String,
    },
    /// Content length exhausted; the client should rebind
    Loop,
    End {
        code: i64,
        message: String,
    },
    /// PROBE, NOOP and friends
    Keepalive,
    /// Informational (SYNC, SERVNAME, CLIENTIP, CONS, PROG, ...)
    Info(String),
    Unknown(String),
}

/// Parse one line, without its line terminator.
pub fn parse_line(line: &str) -> Result<Message, TransportError> {
    let (tag, rest) = match line.split_once(',') {
        Some((tag, rest)) => (tag, rest),
        None => (line, ""),
    };

    let msg = match tag {
        "CONOK" => {
            let parts: Vec<&str> = rest.split(',').collect();
            let session_id = parts
                .first()
                .filter(|s| !s.is_empty())
                .ok_or_else(|| protocol("CONOK without session id", line))?
                .to_string();
            let control_link = parts
                .get(3)
                .filter(|link| !link.is_empty() && **link != "*")
                .map(|link| link.to_string());
            Message::ConOk {
                session_id,
                control_link,
            }
        }
        "CONERR" => {
            let (code, message) = code_and_message(rest, line)?;
            Message::ConErr { code, message }
        }
        "SUBOK" => {
            let mut parts = rest.splitn(3, ',');
            Message::SubOk {
                sub_id: number(parts.next(), line)?,
                items: number(parts.next(), line)?,
                fields: number(parts.next(), line)?,
            }
        }
        "U" => {
            let mut parts = rest.splitn(3, ',');
            let sub_id = number(parts.next(), line)?;
            let item = number(parts.next(), line)?;
            let payload = parts
                .next()
                .ok_or_else(|| protocol("update without payload", line))?
                .to_string();
            Message::Update {
                sub_id,
                item,
                payload,
            }
        }
        "EOS" => Message::EndOfSnapshot {
            sub_id: number(rest.split(',').next(), line)?,
        },
        "CS" => Message::ClearSnapshot {
            sub_id: number(rest.split(',').next(), line)?,
        },
        "REQOK" => Message::ReqOk {
            req_id: number(rest.split(',').next(), line)?,
        },
        "REQERR" => {
            let (req_id, tail) = rest
                .split_once(',')
                .ok_or_else(|| protocol("malformed REQERR", line))?;
            let (code, message) = code_and_message(tail, line)?;
            Message::ReqErr {
                req_id: number(Some(req_id), line)?,
                code,
                message,
            }
        }
        "ERROR" => {
            let (code, message) = code_and_message(rest, line)?;
            Message::Error { code, message }
        }
        "LOOP" => Message::Loop,
        "END" => {
            let (code, message) = code_and_message(rest, line)?;
            Message::End { code, message }
        }
        "PROBE" | "NOOP" => Message::Keepalive,
        "SYNC" | "SERVNAME" | "CLIENTIP" | "CONS" | "PROG" | "CONF" | "UNSUB" | "MSGDONE"
        | "MSGFAIL" | "OV" => Message::Info(line.to_string()),
        _ => Message::Unknown(line.to_string()),
    };

    Ok(msg)
}

/// Current field values for one MERGE-mode item.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeState {
    values: Vec<Option<String>>,
}

impl MergeState {
    pub fn new(fields: usize) -> Self {
        Self {
            values: vec![None; fields],
        }
    }

    /// Resize to the field count the server confirmed, keeping nothing.
    pub fn reset(&mut self, fields: usize) {
        self.values = vec![None; fields];
    }

    pub fn clear(&mut self) {
        self.values.iter_mut().for_each(|v| *v = None);
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.values.get(index).and_then(|v| v.as_deref())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Apply an update payload on top of the current values.
    pub fn apply(&mut self, payload: &str) -> Result<(), TransportError> {
        let mut index = 0;

        for token in payload.split('|') {
            if let Some(count) = token.strip_prefix('^') {
                let count: usize = count
                    .parse()
                    .map_err(|_| protocol("bad skip count", payload))?;
                index += count;
                continue;
            }

            if token.is_empty() {
                index += 1;
                continue;
            }

            let slot = self
                .values
                .get_mut(index)
                .ok_or_else(|| protocol("more fields than the schema", payload))?;
            *slot = match token {
                "#" => None,
                "$" => Some(String::new()),
                encoded => Some(percent_decode_str(encoded).decode_utf8_lossy().into_owned()),
            };
            index += 1;
        }

        if index > self.values.len() {
            return Err(protocol("more fields than the schema", payload));
        }
        Ok(())
    }
}

/// Encode `key=value` pairs as a form body.
pub fn form_body(params: &[(&str, &str)]) -> String {
    params
        .iter()
        .map(|(key, value)| format!("{}={}", key, utf8_percent_encode(value, FORM_VALUE)))
        .collect::<Vec<_>>()
        .join("&")
}

fn code_and_message(rest: &str, line: &str) -> Result<(i64, String), TransportError> {
    let (code, message) = match rest.split_once(',') {
        Some((code, message)) => (code, message),
        None => (rest, ""),
    };
    let code = code
        .parse()
        .map_err(|_| protocol("bad error code", line))?;
    let message = percent_decode_str(message).decode_utf8_lossy().into_owned();
    Ok((code, message))
}

fn number<T: std::str::FromStr>(field: Option<&str>, line: &str) -> Result<T, TransportError> {
    field
        .and_then(|f| f.parse().ok())
        .ok_or_else(|| protocol("expected a number", line))
}

fn protocol(what: &str, line: &str) -> TransportError {
    TransportError::Protocol(format!("{}: {:?}", what, line))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_conok() {
        assert_eq!(
            parse_line("CONOK,S1a2b3c,50000,5000,*").unwrap(),
            Message::ConOk {
                session_id: "S1a2b3c".into(),
                control_link: None,
            }
        );
        assert_eq!(
            parse_line("CONOK,S9,50000,5000,push2.example.com").unwrap(),
            Message::ConOk {
                session_id: "S9".into(),
                control_link: Some("push2.example.com".into()),
            }
        );
    }

    #[test]
    fn parses_errors_with_decoded_messages() {
        assert_eq!(
            parse_line("CONERR,2,Requested%20Adapter%20Set%20not%20available").unwrap(),
            Message::ConErr {
                code: 2,
                message: "Requested Adapter Set not available".into(),
            }
        );
        assert_eq!(
            parse_line("REQERR,1,19,Specified%20subscription%20not%20found").unwrap(),
            Message::ReqErr {
                req_id: 1,
                code: 19,
                message: "Specified subscription not found".into(),
            }
        );
        assert_eq!(
            parse_line("END,31,closed").unwrap(),
            Message::End {
                code: 31,
                message: "closed".into(),
            }
        );
    }

    #[test]
    fn parses_updates_and_subscription_messages() {
        assert_eq!(
            parse_line("SUBOK,1,1,3").unwrap(),
            Message::SubOk {
                sub_id: 1,
                items: 1,
                fields: 3,
            }
        );
        assert_eq!(
            parse_line("U,1,1,42.5|7123.45|24").unwrap(),
            Message::Update {
                sub_id: 1,
                item: 1,
                payload: "42.5|7123.45|24".into(),
            }
        );
        assert_eq!(parse_line("EOS,1,1").unwrap(), Message::EndOfSnapshot { sub_id: 1 });
        assert_eq!(parse_line("PROBE").unwrap(), Message::Keepalive);
        assert_eq!(parse_line("LOOP,0").unwrap(), Message::Loop);
        assert!(matches!(parse_line("SYNC,42").unwrap(), Message::Info(_)));
        assert!(matches!(parse_line("WAT,1").unwrap(), Message::Unknown(_)));
    }

    #[test]
    fn malformed_lines_are_protocol_errors() {
        assert!(matches!(parse_line("CONOK"), Err(TransportError::Protocol(_))));
        assert!(matches!(parse_line("U,x,1,3"), Err(TransportError::Protocol(_))));
        assert!(matches!(parse_line("SUBOK,1"), Err(TransportError::Protocol(_))));
    }

    #[test]
    fn merge_decoding() {
        let mut state = MergeState::new(3);

        state.apply("42.5|100.0|24").unwrap();
        assert_eq!(state.get(0), Some("42.5"));
        assert_eq!(state.get(2), Some("24"));

        // value changes, timestamp and status unchanged
        state.apply("43.0||").unwrap();
        assert_eq!(state.get(0), Some("43.0"));
        assert_eq!(state.get(1), Some("100.0"));
        assert_eq!(state.get(2), Some("24"));

        // skip two, then null
        state.apply("^2|#").unwrap();
        assert_eq!(state.get(0), Some("43.0"));
        assert_eq!(state.get(2), None);

        // empty string and percent-decoding
        state.apply("$|12%3A30|OK%7C1").unwrap();
        assert_eq!(state.get(0), Some(""));
        assert_eq!(state.get(1), Some("12:30"));
        assert_eq!(state.get(2), Some("OK|1"));
    }

    #[test]
    fn merge_rejects_extra_fields() {
        let mut state = MergeState::new(2);
        assert!(state.apply("1|2|3").is_err());
        assert!(state.apply("^3").is_err());
    }

    #[test]
    fn form_body_encodes_spaces_as_percent_twenty() {
        let body = form_body(&[
            ("LS_cid", "mgQkwtwdysogQz2BJ4Ji kOj2Bg"),
            ("LS_schema", "Value TimeStamp Status.Class"),
        ]);
        assert_eq!(
            body,
            "LS_cid=mgQkwtwdysogQz2BJ4Ji%20kOj2Bg&LS_schema=Value%20TimeStamp%20Status.Class"
        );
    }
}
