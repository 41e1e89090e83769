use crate::breakpoint::Mode;
use crate::util::{to_hex, to_hex_le};
use libc::pid_t;

/// Everything a stop reply can carry. The delegate fills it in; the
/// session serializes it.
#[derive(Clone, Debug, Default)]
pub struct StopReply {
    pub signal: i32,
    pub tid: pid_t,
    /// Expedited registers: (protocol regno, value, byte width).
    pub registers: Vec<(usize, u64, usize)>,
    pub reason: Option<&'static str>,
    pub description: Option<String>,
    pub watch: Option<(Mode, u64)>,
    /// Sent only when QListThreadsInStopReply was negotiated.
    pub threads: Vec<pid_t>,
}

pub fn encode_exit(code: i32) -> Vec<u8> {
    format!("W{:02x}", code & 0xff).into_bytes()
}

pub fn encode_killed(signal: i32) -> Vec<u8> {
    format!("X{:02x}", signal & 0xff).into_bytes()
}

/// Serialize a `T` stop reply:
/// `T<sig>thread:<tid>;<regno>:<hex>;reason:<str>;description:<hex>;` with
/// optional watch fields and the negotiated thread list.
pub fn encode_stop(reply: &StopReply, list_threads: bool) -> Vec<u8> {
    let mut out = format!("T{:02x}", reply.signal & 0xff);
    if reply.tid > 0 {
        out.push_str(&format!("thread:{:x};", reply.tid));
    }
    if list_threads && !reply.threads.is_empty() {
        out.push_str("threads:");
        for (i, tid) in reply.threads.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            out.push_str(&format!("{:x}", tid));
        }
        out.push(';');
    }
    for (regno, value, size) in &reply.registers {
        out.push_str(&format!("{:02x}:{};", regno, to_hex_le(*value, *size)));
    }
    if let Some((mode_bits, address)) = reply.watch {
        let key = if mode_bits == Mode::access() {
            "awatch"
        } else if mode_bits.contains(Mode::READ) {
            "rwatch"
        } else {
            "watch"
        };
        out.push_str(&format!("{}:{:x};", key, address));
    }
    if let Some(reason) = reply.reason {
        out.push_str(&format!("reason:{};", reason));
    }
    if let Some(description) = &reply.description {
        out.push_str(&format!("description:{};", to_hex(description.as_bytes())));
    }
    out.into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_packets() {
        assert_eq!(encode_exit(0), b"W00".to_vec());
        assert_eq!(encode_exit(0x17), b"W17".to_vec());
        assert_eq!(encode_killed(libc::SIGKILL), b"X09".to_vec());
    }

    #[test]
    fn minimal_stop_reply() {
        let reply = StopReply {
            signal: 5,
            tid: 0x1234,
            ..Default::default()
        };
        assert_eq!(encode_stop(&reply, false), b"T05thread:1234;".to_vec());
    }

    #[test]
    fn full_stop_reply() {
        let reply = StopReply {
            signal: 5,
            tid: 0x10,
            registers: vec![(0, 0, 8), (32, 0x1000, 8)],
            reason: Some("breakpoint"),
            description: None,
            watch: None,
            threads: vec![0x10, 0x11],
        };
        let encoded = String::from_utf8(encode_stop(&reply, true)).unwrap();
        assert!(encoded.starts_with("T05thread:10;threads:10,11;"));
        assert!(encoded.contains("00:0000000000000000;"));
        assert!(encoded.contains("20:0010000000000000;"));
        assert!(encoded.ends_with("reason:breakpoint;"));
    }

    #[test]
    fn reason_and_description_are_always_reported() {
        let reply = StopReply {
            signal: 2,
            tid: 1,
            reason: Some("signal"),
            description: Some("interrupt".to_owned()),
            ..Default::default()
        };
        let encoded = String::from_utf8(encode_stop(&reply, false)).unwrap();
        assert_eq!(
            encoded,
            format!("T02thread:1;reason:signal;description:{};", to_hex(b"interrupt"))
        );
    }

    #[test]
    fn thread_list_only_when_negotiated() {
        let reply = StopReply {
            signal: 5,
            tid: 1,
            threads: vec![1, 2],
            ..Default::default()
        };
        let encoded = String::from_utf8(encode_stop(&reply, false)).unwrap();
        assert!(!encoded.contains("threads:"));
        let encoded = String::from_utf8(encode_stop(&reply, true)).unwrap();
        assert!(encoded.contains("threads:1,2;"));
    }

    #[test]
    fn watchpoint_keys() {
        let mut reply = StopReply {
            signal: 5,
            tid: 1,
            watch: Some((Mode::WRITE, 0xcafe)),
            ..Default::default()
        };
        let encoded = String::from_utf8(encode_stop(&reply, false)).unwrap();
        assert!(encoded.contains("watch:cafe;"));
        reply.watch = Some((Mode::access(), 0xcafe));
        let encoded = String::from_utf8(encode_stop(&reply, false)).unwrap();
        assert!(encoded.contains("awatch:cafe;"));
    }
}
