use crate::error::{ErrorCode, Result};
use crate::host::platform::ProcessInfoMatch;
use crate::log::LogLevel::{LogDebug, LogPacket};
use crate::session::delegate::{BreakpointType, SessionDelegate, StopOutcome};
use crate::session::packet::{PacketCodec, PacketEvent};
use crate::session::platform_session::format_process_info;
use crate::session::queue_channel::{QueueChannel, SessionEvent};
use crate::session::stop_reply::{encode_exit, encode_killed, encode_stop};
use crate::session::CompatibilityMode;
use crate::target::{ResumeAction, ResumeKind};
use crate::util::{from_hex, parse_dec_u64, parse_hex_i64, parse_hex_u64, to_hex};
use libc::pid_t;
use std::sync::Arc;

const PACKET_SIZE: usize = 0x1000;

/// Per-connection protocol dispatcher: reads one event, maps it to a
/// delegate call, writes at most one response.
pub struct Session {
    channel: Arc<QueueChannel>,
    delegate: Box<dyn SessionDelegate>,
    mode: CompatibilityMode,
    /// Frames raw-mode byte events; a cooked channel decodes in its worker
    /// and this codec sees no traffic.
    codec: PacketCodec,
    thread_suffix: bool,
    list_threads_in_stop_reply: bool,
    closing: bool,
}

fn error_reply(code: ErrorCode) -> Vec<u8> {
    format!("E{:02x}", code.gdb_errno()).into_bytes()
}

fn ok_or_error(result: Result<()>) -> Vec<u8> {
    match result {
        Ok(()) => b"OK".to_vec(),
        Err(code) => error_reply(code),
    }
}

impl Session {
    pub fn new(
        channel: Arc<QueueChannel>,
        delegate: Box<dyn SessionDelegate>,
        mode: CompatibilityMode,
    ) -> Session {
        Session {
            channel,
            delegate,
            mode,
            codec: PacketCodec::new(),
            thread_suffix: false,
            list_threads_in_stop_reply: false,
            closing: false,
        }
    }

    /// The receive loop. Returns when the channel closes or the session
    /// decides it is done (`k`).
    pub fn run(&mut self, cooked: bool) {
        log!(LogDebug, "session starting ({:?} dialect)", self.mode);
        while !self.closing {
            match self.channel.receive(cooked) {
                SessionEvent::Closed => break,
                SessionEvent::Interrupt => self.delegate.on_interrupt(),
                SessionEvent::Packet(payload) => {
                    if let Some(reply) = self.dispatch(&payload) {
                        if self.channel.send_packet(&reply).is_err() {
                            break;
                        }
                    }
                }
                SessionEvent::Raw(bytes) => self.handle_raw_bytes(&bytes),
            }
        }
        self.channel.close();
        log!(LogDebug, "session ended");
    }

    /// Frame undecoded bytes from a raw-mode channel and dispatch the
    /// packets found in them, answering the acknowledgement traffic
    /// ourselves. Interrupt bytes are line noise here: raw mode serves
    /// sessions that drive no inferior.
    fn handle_raw_bytes(&mut self, bytes: &[u8]) {
        for event in self.codec.feed(bytes) {
            let ack = !self.codec.no_ack_mode();
            match event {
                PacketEvent::Packet(payload) => {
                    if ack {
                        let _ = self.channel.send_bytes(b"+");
                    }
                    log!(LogPacket, "recv: {}", String::from_utf8_lossy(&payload));
                    if let Some(reply) = self.dispatch(&payload) {
                        if self.channel.send_packet(&reply).is_err() {
                            self.closing = true;
                            return;
                        }
                    }
                    if self.closing {
                        return;
                    }
                }
                PacketEvent::ChecksumError => {
                    log!(LogDebug, "received frame with bad checksum");
                    if ack {
                        let _ = self.channel.send_bytes(b"-");
                    }
                }
                PacketEvent::Ack => {}
                PacketEvent::Nak => {
                    let _ = self.channel.resend_last();
                }
                PacketEvent::Interrupt => {}
            }
        }
    }

    fn stop_outcome_reply(&mut self, outcome: Result<StopOutcome>) -> Vec<u8> {
        match outcome {
            Ok(StopOutcome::Stopped(reply)) => {
                encode_stop(&reply, self.list_threads_in_stop_reply)
            }
            Ok(StopOutcome::Exited(code)) => encode_exit(code),
            Ok(StopOutcome::Killed(signal)) => encode_killed(signal),
            Err(code) => error_reply(code),
        }
    }

    /// Strip a negotiated `;thread:<tid>;` suffix, returning the thread.
    fn split_thread_suffix<'a>(&self, args: &'a [u8]) -> (&'a [u8], Option<pid_t>) {
        if !self.thread_suffix {
            return (args, None);
        }
        let text = args;
        if let Some(at) = find_subslice(text, b";thread:") {
            let rest = &text[at + 8..];
            let end = rest
                .iter()
                .position(|&b| b == b';')
                .unwrap_or(rest.len());
            if let Ok(tid) = parse_hex_u64(&rest[..end]) {
                return (&text[..at], Some(tid as pid_t));
            }
        }
        (args, None)
    }

    pub fn dispatch(&mut self, payload: &[u8]) -> Option<Vec<u8>> {
        if payload.is_empty() {
            return Some(Vec::new());
        }
        match payload[0] {
            b'?' => Some(self.handle_stop_reason()),
            b'c' | b'C' | b's' | b'S' => Some(self.handle_legacy_resume(payload)),
            b'D' => Some(ok_or_error(self.delegate.on_detach())),
            b'k' => self.handle_kill(),
            b'H' => Some(self.handle_thread_select(payload)),
            b'T' => Some(self.handle_thread_alive(&payload[1..])),
            b'g' => Some(self.handle_read_registers(&payload[1..])),
            b'G' => Some(self.handle_write_registers(&payload[1..])),
            b'p' => Some(self.handle_read_register(&payload[1..])),
            b'P' => Some(self.handle_write_register(&payload[1..])),
            b'm' => Some(self.handle_read_memory(&payload[1..])),
            b'M' => Some(self.handle_write_memory(&payload[1..], false)),
            b'X' => Some(self.handle_write_memory(&payload[1..], true)),
            b'Z' | b'z' => Some(self.handle_breakpoint(payload)),
            b'A' => Some(self.handle_set_arguments(&payload[1..])),
            b'_' => Some(self.handle_allocation(payload)),
            b'q' | b'Q' | b'v' => self.handle_named(payload),
            _ => Some(Vec::new()),
        }
    }

    fn handle_stop_reason(&mut self) -> Vec<u8> {
        let outcome = self.delegate.on_stop_reason();
        self.stop_outcome_reply(outcome)
    }

    fn handle_kill(&mut self) -> Option<Vec<u8>> {
        let outcome = self.delegate.on_kill();
        let reply = self.stop_outcome_reply(outcome);
        let _ = self.channel.send_packet(&reply);
        self.closing = true;
        None
    }

    /// `c` / `C<sig>` / `s` / `S<sig>`, each with an optional address we do
    /// not honor (resume always continues from the current pc).
    fn handle_legacy_resume(&mut self, payload: &[u8]) -> Vec<u8> {
        let step = payload[0] == b's' || payload[0] == b'S';
        let with_signal = payload[0] == b'C' || payload[0] == b'S';
        let mut signal = None;
        if with_signal {
            let args = &payload[1..];
            let end = args
                .iter()
                .position(|&b| b == b';')
                .unwrap_or(args.len());
            match parse_hex_u64(&args[..end]) {
                Ok(sig) => signal = Some(sig as i32),
                Err(code) => return error_reply(code),
            }
        }
        let action = ResumeAction {
            kind: if step {
                ResumeKind::Step
            } else {
                ResumeKind::Continue
            },
            tid: None,
            signal,
        };
        let outcome = self.delegate.on_resume(vec![action]);
        self.stop_outcome_reply(outcome)
    }

    fn handle_thread_select(&mut self, payload: &[u8]) -> Vec<u8> {
        if payload.len() < 3 {
            return error_reply(ErrorCode::InvalidArgument);
        }
        let for_continue = match payload[1] {
            b'c' => true,
            b'g' => false,
            _ => return error_reply(ErrorCode::InvalidArgument),
        };
        match parse_thread_id(&payload[2..]) {
            Ok(tid) => ok_or_error(self.delegate.on_select_thread(for_continue, tid)),
            Err(code) => error_reply(code),
        }
    }

    fn handle_thread_alive(&mut self, args: &[u8]) -> Vec<u8> {
        match parse_thread_id(args) {
            Ok(tid) => match self.delegate.on_thread_alive(tid as pid_t) {
                Ok(true) => b"OK".to_vec(),
                Ok(false) => error_reply(ErrorCode::ProcessNotFound),
                Err(code) => error_reply(code),
            },
            Err(code) => error_reply(code),
        }
    }

    fn handle_read_registers(&mut self, args: &[u8]) -> Vec<u8> {
        let (_, tid) = self.split_thread_suffix(args);
        match self.delegate.on_read_registers(tid) {
            Ok(bytes) => to_hex(&bytes).into_bytes(),
            Err(code) => error_reply(code),
        }
    }

    fn handle_write_registers(&mut self, args: &[u8]) -> Vec<u8> {
        let (body, tid) = self.split_thread_suffix(args);
        match from_hex(body) {
            Ok(bytes) => ok_or_error(self.delegate.on_write_registers(tid, &bytes)),
            Err(code) => error_reply(code),
        }
    }

    fn handle_read_register(&mut self, args: &[u8]) -> Vec<u8> {
        let (body, tid) = self.split_thread_suffix(args);
        match parse_hex_u64(body) {
            Ok(regno) => match self.delegate.on_read_register(tid, regno as usize) {
                Ok(bytes) => to_hex(&bytes).into_bytes(),
                Err(code) => error_reply(code),
            },
            Err(code) => error_reply(code),
        }
    }

    fn handle_write_register(&mut self, args: &[u8]) -> Vec<u8> {
        let (body, tid) = self.split_thread_suffix(args);
        let eq = match body.iter().position(|&b| b == b'=') {
            Some(eq) => eq,
            None => return error_reply(ErrorCode::InvalidArgument),
        };
        let regno = match parse_hex_u64(&body[..eq]) {
            Ok(regno) => regno as usize,
            Err(code) => return error_reply(code),
        };
        match from_hex(&body[eq + 1..]) {
            Ok(bytes) => ok_or_error(self.delegate.on_write_register(tid, regno, &bytes)),
            Err(code) => error_reply(code),
        }
    }

    fn handle_read_memory(&mut self, args: &[u8]) -> Vec<u8> {
        match parse_addr_length(args) {
            Ok((address, length, _)) => match self.delegate.on_read_memory(address, length) {
                Ok(bytes) => to_hex(&bytes).into_bytes(),
                Err(code) => error_reply(code),
            },
            Err(code) => error_reply(code),
        }
    }

    fn handle_write_memory(&mut self, args: &[u8], binary: bool) -> Vec<u8> {
        let (address, length, rest) = match parse_addr_length(args) {
            Ok(parsed) => parsed,
            Err(code) => return error_reply(code),
        };
        let rest = match rest {
            Some(rest) => rest,
            None => return error_reply(ErrorCode::InvalidArgument),
        };
        let data = if binary {
            rest.to_vec()
        } else {
            match from_hex(rest) {
                Ok(data) => data,
                Err(code) => return error_reply(code),
            }
        };
        if data.len() != length {
            return error_reply(ErrorCode::InvalidArgument);
        }
        ok_or_error(self.delegate.on_write_memory(address, &data))
    }

    fn handle_breakpoint(&mut self, payload: &[u8]) -> Vec<u8> {
        let insert = payload[0] == b'Z';
        let args = &payload[1..];
        let mut fields = args.split(|&b| b == b',');
        let kind = fields
            .next()
            .filter(|f| f.len() == 1)
            .and_then(|f| BreakpointType::from_z(f[0]));
        let address = fields.next().map(parse_hex_u64);
        let size = fields.next().map(parse_hex_u64);
        let (kind, address, size) = match (kind, address, size) {
            (Some(kind), Some(Ok(address)), Some(Ok(size))) => (kind, address, size),
            _ => return error_reply(ErrorCode::InvalidArgument),
        };
        let result = if insert {
            self.delegate
                .on_insert_breakpoint(kind, address, size as usize)
        } else {
            self.delegate.on_remove_breakpoint(kind, address)
        };
        match result {
            Ok(()) => b"OK".to_vec(),
            // An empty reply tells the debugger this kind is unsupported.
            Err(ErrorCode::Unsupported) => Vec::new(),
            Err(code) => error_reply(code),
        }
    }

    /// `A arglen,argnum,hexarg,...`
    fn handle_set_arguments(&mut self, args: &[u8]) -> Vec<u8> {
        let mut decoded: Vec<(u64, String)> = Vec::new();
        for field in args.split(|&b| b == b',').collect::<Vec<_>>().chunks(3) {
            if field.len() != 3 {
                return error_reply(ErrorCode::InvalidArgument);
            }
            let index = match parse_dec_u64(field[1]) {
                Ok(index) => index,
                Err(code) => return error_reply(code),
            };
            let arg = match from_hex(field[2]).and_then(|raw| {
                String::from_utf8(raw).map_err(|_| ErrorCode::InvalidArgument)
            }) {
                Ok(arg) => arg,
                Err(code) => return error_reply(code),
            };
            decoded.push((index, arg));
        }
        decoded.sort_by_key(|(index, _)| *index);
        let arguments: Vec<String> = decoded.into_iter().map(|(_, arg)| arg).collect();
        if arguments.is_empty() {
            return error_reply(ErrorCode::InvalidArgument);
        }
        ok_or_error(self.delegate.on_set_arguments(arguments))
    }

    /// `_M<size>,<permissions>` and `_m<address>`.
    fn handle_allocation(&mut self, payload: &[u8]) -> Vec<u8> {
        if payload.len() < 2 {
            return Vec::new();
        }
        match payload[1] {
            b'M' => {
                let args = &payload[2..];
                let comma = match args.iter().position(|&b| b == b',') {
                    Some(comma) => comma,
                    None => return error_reply(ErrorCode::InvalidArgument),
                };
                let size = match parse_hex_u64(&args[..comma]) {
                    Ok(size) => size,
                    Err(code) => return error_reply(code),
                };
                let mut prot = 0;
                for &b in &args[comma + 1..] {
                    match b {
                        b'r' => prot |= libc::PROT_READ,
                        b'w' => prot |= libc::PROT_WRITE,
                        b'x' => prot |= libc::PROT_EXEC,
                        _ => return error_reply(ErrorCode::InvalidArgument),
                    }
                }
                match self.delegate.on_allocate_memory(size, prot) {
                    Ok(address) => format!("{:x}", address).into_bytes(),
                    Err(code) => error_reply(code),
                }
            }
            b'm' => match parse_hex_u64(&payload[2..]) {
                Ok(address) => ok_or_error(self.delegate.on_deallocate_memory(address)),
                Err(code) => error_reply(code),
            },
            _ => Vec::new(),
        }
    }

    /// q*, Q* and v* packets, matched by name. Returns None when the reply
    /// was already written (ack-mode negotiation).
    fn handle_named(&mut self, payload: &[u8]) -> Option<Vec<u8>> {
        // qRegisterInfo glues its argument straight onto the name.
        if let Some(rest) = payload.strip_prefix(b"qRegisterInfo") {
            return Some(match parse_hex_u64(rest) {
                Ok(regno) => match self.delegate.on_register_info(regno as usize) {
                    Ok(info) => info.into_bytes(),
                    Err(code) => error_reply(code),
                },
                Err(code) => error_reply(code),
            });
        }
        let (name, args) = split_named(payload);
        Some(match name {
            "qSupported" => {
                let mut features = vec![
                    format!("PacketSize={:x}", PACKET_SIZE),
                    "QStartNoAckMode+".to_owned(),
                    "QThreadSuffixSupported+".to_owned(),
                    "QListThreadsInStopReply+".to_owned(),
                ];
                features.extend(self.delegate.supported_features());
                features.join(";").into_bytes()
            }
            "QStartNoAckMode" => {
                // The OK below is still acknowledged by the peer; only
                // packets after it drop the ack traffic. Both the channel
                // worker's codec and the raw-mode one flip together.
                let _ = self.channel.send_packet(b"OK");
                self.channel.set_no_ack_mode(true);
                self.codec.set_no_ack_mode(true);
                return None;
            }
            "QThreadSuffixSupported" => {
                self.thread_suffix = true;
                b"OK".to_vec()
            }
            "QListThreadsInStopReply" => {
                self.list_threads_in_stop_reply = true;
                b"OK".to_vec()
            }
            "QSetDisableASLR" => match args {
                b"1" => ok_or_error(self.delegate.on_disable_aslr(true)),
                b"0" => ok_or_error(self.delegate.on_disable_aslr(false)),
                _ => error_reply(ErrorCode::InvalidArgument),
            },
            "QSetSTDIN" | "QSetSTDOUT" | "QSetSTDERR" => {
                let fileno = match name {
                    "QSetSTDIN" => 0,
                    "QSetSTDOUT" => 1,
                    _ => 2,
                };
                match decode_hex_string(args) {
                    Ok(path) => ok_or_error(self.delegate.on_set_std_file(fileno, &path)),
                    Err(code) => error_reply(code),
                }
            }
            "QSetWorkingDir" => match decode_hex_string(args) {
                Ok(path) => ok_or_error(self.delegate.on_set_working_dir(&path)),
                Err(code) => error_reply(code),
            },
            "qGetWorkingDir" => match self.delegate.on_query_working_dir() {
                Ok(dir) => to_hex(dir.as_bytes()).into_bytes(),
                Err(code) => error_reply(code),
            },
            "QEnvironment" => self.handle_environment(args),
            "QEnvironmentHexEncoded" => match from_hex(args) {
                Ok(raw) => self.handle_environment(&raw),
                Err(code) => error_reply(code),
            },
            "qC" => match self.delegate.on_current_thread() {
                Ok(tid) => format!("QC{:x}", tid).into_bytes(),
                Err(code) => error_reply(code),
            },
            "qfThreadInfo" => match self.delegate.on_thread_list() {
                Ok(tids) => {
                    let mut out = String::from("m");
                    for (i, tid) in tids.iter().enumerate() {
                        if i > 0 {
                            out.push(',');
                        }
                        out.push_str(&format!("{:x}", tid));
                    }
                    out.into_bytes()
                }
                Err(code) => error_reply(code),
            },
            "qsThreadInfo" => b"l".to_vec(),
            "qThreadExtraInfo" => match parse_hex_u64(args) {
                Ok(tid) => match self.delegate.on_thread_extra_info(tid as pid_t) {
                    Ok(info) => to_hex(info.as_bytes()).into_bytes(),
                    Err(code) => error_reply(code),
                },
                Err(code) => error_reply(code),
            },
            "qRegisterInfo" => match parse_hex_u64(args) {
                Ok(regno) => match self.delegate.on_register_info(regno as usize) {
                    Ok(info) => info.into_bytes(),
                    Err(code) => error_reply(code),
                },
                Err(code) => error_reply(code),
            },
            "qHostInfo" => match self.delegate.on_host_info() {
                Ok(info) => info.into_bytes(),
                Err(code) => error_reply(code),
            },
            "qProcessInfoPID" => match parse_dec_u64(args) {
                Ok(pid) => match self.delegate.on_query_process_info_pid(pid as pid_t) {
                    Ok(info) => format_process_info(&info).into_bytes(),
                    Err(code) => error_reply(code),
                },
                Err(code) => error_reply(code),
            },
            "qProcessInfo" => match self.delegate.on_process_info() {
                Ok(info) => info.into_bytes(),
                Err(code) => error_reply(code),
            },
            "qModuleInfo" => self.handle_module_info(args),
            "qLaunchSuccess" => ok_or_error(self.delegate.on_query_launch_success(None)),
            "qLaunchGDBServer" => self.handle_launch_gdb_server(args),
            "qKillSpawnedProcess" => match parse_dec_u64(args) {
                Ok(pid) => ok_or_error(self.delegate.on_kill_spawned_process(pid as pid_t)),
                Err(code) => error_reply(code),
            },
            "qfProcessInfo" => self.handle_process_list(args, true),
            "qsProcessInfo" => self.handle_process_list(args, false),
            "qUserName" => match parse_dec_u64(args) {
                Ok(uid) => match self.delegate.on_query_user_name(uid as u32) {
                    Ok(user) => to_hex(user.as_bytes()).into_bytes(),
                    Err(code) => error_reply(code),
                },
                Err(code) => error_reply(code),
            },
            "qGroupName" => match parse_dec_u64(args) {
                Ok(gid) => match self.delegate.on_query_group_name(gid as u32) {
                    Ok(group) => to_hex(group.as_bytes()).into_bytes(),
                    Err(code) => error_reply(code),
                },
                Err(code) => error_reply(code),
            },
            "qMemoryRegionInfo" => match parse_hex_u64(args) {
                Ok(address) => match self.delegate.on_query_memory_region(address) {
                    Ok(info) => info.into_bytes(),
                    Err(code) => error_reply(code),
                },
                Err(code) => error_reply(code),
            },
            "qEcho" => payload.to_vec(),
            "vCont?" => b"vCont;c;C;s;S;t".to_vec(),
            "vCont" => self.handle_vcont(args),
            "vFile" => self.handle_vfile(args),
            _ => Vec::new(),
        })
    }

    fn handle_environment(&mut self, args: &[u8]) -> Vec<u8> {
        let text = match std::str::from_utf8(args) {
            Ok(text) => text,
            Err(_) => return error_reply(ErrorCode::InvalidArgument),
        };
        match text.split_once('=') {
            Some((key, value)) if !key.is_empty() => {
                ok_or_error(self.delegate.on_set_environment(key, Some(value)))
            }
            _ if !text.is_empty() => ok_or_error(self.delegate.on_set_environment(text, None)),
            _ => error_reply(ErrorCode::InvalidArgument),
        }
    }

    fn handle_module_info(&mut self, args: &[u8]) -> Vec<u8> {
        let mut fields = args.split(|&b| b == b';');
        let path = fields.next().map(decode_hex_string);
        let triple = fields.next().map(decode_hex_string);
        match (path, triple) {
            (Some(Ok(path)), Some(Ok(triple))) => {
                match self.delegate.on_query_module_info(&path, &triple) {
                    Ok(info) => info.into_bytes(),
                    Err(code) => error_reply(code),
                }
            }
            _ => error_reply(ErrorCode::InvalidArgument),
        }
    }

    fn handle_launch_gdb_server(&mut self, args: &[u8]) -> Vec<u8> {
        let mut host = String::new();
        for field in args.split(|&b| b == b';') {
            if let Some(value) = field.strip_prefix(b"host:") {
                host = String::from_utf8_lossy(value).into_owned();
            }
        }
        match self.delegate.on_launch_gdb_server(&host) {
            Ok((port, pid)) => format!("pid:{};port:{};", pid, port).into_bytes(),
            Err(code) => error_reply(code),
        }
    }

    fn handle_process_list(&mut self, args: &[u8], first: bool) -> Vec<u8> {
        let filter = match parse_process_filter(args) {
            Ok(filter) => filter,
            Err(code) => return error_reply(code),
        };
        match self.delegate.on_query_process_list(filter, first) {
            Ok(info) => format_process_info(&info).into_bytes(),
            Err(code) => error_reply(code),
        }
    }

    fn handle_vcont(&mut self, args: &[u8]) -> Vec<u8> {
        let mut actions = Vec::new();
        for field in args.split(|&b| b == b';') {
            if field.is_empty() {
                continue;
            }
            let (action, thread) = match field.iter().position(|&b| b == b':') {
                Some(colon) => (&field[..colon], Some(&field[colon + 1..])),
                None => (&field[..], None),
            };
            let tid = match thread {
                None => None,
                Some(spec) => match parse_thread_id(spec) {
                    Ok(tid) if tid > 0 => Some(tid as pid_t),
                    Ok(_) => None,
                    Err(code) => return error_reply(code),
                },
            };
            if action.is_empty() {
                return error_reply(ErrorCode::InvalidArgument);
            }
            let (kind, signal) = match action[0] {
                b'c' => (ResumeKind::Continue, None),
                b's' => (ResumeKind::Step, None),
                b't' => (ResumeKind::Stop, None),
                b'C' | b'S' => {
                    let signal = match parse_hex_u64(&action[1..]) {
                        Ok(signal) => signal as i32,
                        Err(code) => return error_reply(code),
                    };
                    (
                        if action[0] == b'C' {
                            ResumeKind::Continue
                        } else {
                            ResumeKind::Step
                        },
                        Some(signal),
                    )
                }
                _ => return error_reply(ErrorCode::InvalidArgument),
            };
            actions.push(ResumeAction { kind, tid, signal });
        }
        if actions.is_empty() {
            return error_reply(ErrorCode::InvalidArgument);
        }
        let outcome = self.delegate.on_resume(actions);
        self.stop_outcome_reply(outcome)
    }

    fn handle_vfile(&mut self, args: &[u8]) -> Vec<u8> {
        let (op, rest) = match args.iter().position(|&b| b == b':') {
            Some(colon) => (&args[..colon], &args[colon + 1..]),
            None => (args, &args[..0]),
        };
        match op {
            b"open" => {
                let mut fields = rest.split(|&b| b == b',');
                let path = fields.next().map(decode_hex_string);
                let flags = fields.next().map(parse_hex_u64);
                let mode = fields.next().map(parse_hex_u64);
                match (path, flags, mode) {
                    (Some(Ok(path)), Some(Ok(flags)), Some(Ok(mode))) => file_reply(
                        self.delegate
                            .on_file_open(&path, flags as u32, mode as u32)
                            .map(|fd| fd as i64),
                    ),
                    _ => file_error(ErrorCode::InvalidArgument),
                }
            }
            b"close" => match parse_hex_u64(rest) {
                Ok(fd) => file_reply(self.delegate.on_file_close(fd as i32).map(|_| 0)),
                Err(code) => file_error(code),
            },
            b"pread" => {
                let mut fields = rest.split(|&b| b == b',');
                let fd = fields.next().map(parse_hex_u64);
                let count = fields.next().map(parse_hex_u64);
                let offset = fields.next().map(parse_hex_u64);
                match (fd, count, offset) {
                    (Some(Ok(fd)), Some(Ok(count)), Some(Ok(offset))) => {
                        match self
                            .delegate
                            .on_file_pread(fd as i32, count as usize, offset)
                        {
                            Ok(data) => file_data_reply(&data),
                            Err(code) => file_error(code),
                        }
                    }
                    _ => file_error(ErrorCode::InvalidArgument),
                }
            }
            b"pwrite" => {
                let mut fields = rest.splitn(3, |&b| b == b',');
                let fd = fields.next().map(parse_hex_u64);
                let offset = fields.next().map(parse_hex_u64);
                let data = fields.next();
                match (fd, offset, data) {
                    (Some(Ok(fd)), Some(Ok(offset)), Some(data)) => file_reply(
                        self.delegate
                            .on_file_pwrite(fd as i32, offset, data)
                            .map(|n| n as i64),
                    ),
                    _ => file_error(ErrorCode::InvalidArgument),
                }
            }
            b"fstat" => match parse_hex_u64(rest) {
                Ok(fd) => match self.delegate.on_file_fstat(fd as i32) {
                    Ok(data) => file_data_reply(&data),
                    Err(code) => file_error(code),
                },
                Err(code) => file_error(code),
            },
            b"stat" => match decode_hex_string(rest) {
                Ok(path) => match self.delegate.on_file_stat(&path) {
                    Ok(data) => file_data_reply(&data),
                    Err(code) => file_error(code),
                },
                Err(code) => file_error(code),
            },
            b"unlink" => match decode_hex_string(rest) {
                Ok(path) => file_reply(self.delegate.on_file_unlink(&path).map(|_| 0)),
                Err(code) => file_error(code),
            },
            b"readlink" => match decode_hex_string(rest) {
                Ok(path) => match self.delegate.on_file_readlink(&path) {
                    Ok(target) => file_data_reply(target.as_bytes()),
                    Err(code) => file_error(code),
                },
                Err(code) => file_error(code),
            },
            b"mkdir" => {
                let mut fields = rest.split(|&b| b == b',');
                let path = fields.next().map(decode_hex_string);
                let mode = fields.next().map(parse_hex_u64);
                match (path, mode) {
                    (Some(Ok(path)), Some(Ok(mode))) => {
                        file_reply(self.delegate.on_file_mkdir(&path, mode as u32).map(|_| 0))
                    }
                    _ => file_error(ErrorCode::InvalidArgument),
                }
            }
            b"chmod" => {
                let mut fields = rest.split(|&b| b == b',');
                let path = fields.next().map(decode_hex_string);
                let mode = fields.next().map(parse_hex_u64);
                match (path, mode) {
                    (Some(Ok(path)), Some(Ok(mode))) => {
                        file_reply(self.delegate.on_file_chmod(&path, mode as u32).map(|_| 0))
                    }
                    _ => file_error(ErrorCode::InvalidArgument),
                }
            }
            _ => Vec::new(),
        }
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|window| window == needle)
}

fn file_reply(result: Result<i64>) -> Vec<u8> {
    match result {
        Ok(value) => format!("F{:x}", value).into_bytes(),
        Err(code) => file_error(code),
    }
}

fn file_error(code: ErrorCode) -> Vec<u8> {
    format!("F-1,{:02x}", code.gdb_errno()).into_bytes()
}

fn file_data_reply(data: &[u8]) -> Vec<u8> {
    let mut out = format!("F{:x};", data.len()).into_bytes();
    out.extend_from_slice(data);
    out
}

/// `<name>[:;]args` for q/Q/v packets. The name runs to the first ':', ';'
/// or ',' that is not part of the name itself.
fn split_named(payload: &[u8]) -> (&str, &[u8]) {
    let end = payload
        .iter()
        .position(|&b| b == b':' || b == b';' || b == b',')
        .unwrap_or(payload.len());
    let name = std::str::from_utf8(&payload[..end]).unwrap_or("");
    let args = if end < payload.len() {
        &payload[end + 1..]
    } else {
        &payload[payload.len()..]
    };
    (name, args)
}

fn decode_hex_string(text: &[u8]) -> Result<String> {
    let raw = from_hex(text)?;
    String::from_utf8(raw).map_err(|_| ErrorCode::InvalidArgument)
}

/// `<addr>,<len>[:<rest>]`.
fn parse_addr_length(args: &[u8]) -> Result<(u64, usize, Option<&[u8]>)> {
    let comma = args
        .iter()
        .position(|&b| b == b',')
        .ok_or(ErrorCode::InvalidArgument)?;
    let address = parse_hex_u64(&args[..comma])?;
    let rest = &args[comma + 1..];
    match rest.iter().position(|&b| b == b':') {
        Some(colon) => {
            let length = parse_hex_u64(&rest[..colon])?;
            Ok((address, length as usize, Some(&rest[colon + 1..])))
        }
        None => {
            let length = parse_hex_u64(rest)?;
            Ok((address, length as usize, None))
        }
    }
}

/// Thread ids come as `<tid>`, `-1`, or `p<pid>.<tid>`.
fn parse_thread_id(spec: &[u8]) -> Result<i64> {
    let spec = match spec.strip_prefix(b"p") {
        Some(rest) => match rest.iter().position(|&b| b == b'.') {
            Some(dot) => &rest[dot + 1..],
            None => rest,
        },
        None => spec,
    };
    parse_hex_i64(spec)
}

/// qfProcessInfo filter: `key:value;...` with hex-encoded names.
fn parse_process_filter(args: &[u8]) -> Result<ProcessInfoMatch> {
    let mut filter = ProcessInfoMatch::default();
    for field in args.split(|&b| b == b';') {
        if field.is_empty() {
            continue;
        }
        let colon = field
            .iter()
            .position(|&b| b == b':')
            .ok_or(ErrorCode::InvalidArgument)?;
        let key = &field[..colon];
        let value = &field[colon + 1..];
        match key {
            b"name" => filter.name = decode_hex_string(value)?,
            b"name_match" => {
                filter.name_match = String::from_utf8_lossy(value).into_owned();
            }
            b"pid" => filter.pid = parse_dec_u64(value)? as pid_t,
            b"parent_pid" => filter.parent_pid = parse_dec_u64(value)? as pid_t,
            b"uid" => filter.real_uid = Some(parse_dec_u64(value)? as u32),
            b"gid" => filter.real_gid = Some(parse_dec_u64(value)? as u32),
            b"euid" => filter.effective_uid = Some(parse_dec_u64(value)? as u32),
            b"egid" => filter.effective_gid = Some(parse_dec_u64(value)? as u32),
            // Unknown keys (triple, all_users) are tolerated.
            _ => {}
        }
    }
    Ok(filter)
}
