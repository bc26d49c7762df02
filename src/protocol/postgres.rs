use std::collections::HashMap;

use bytes::BytesMut;
use tracing::{trace, warn};

/// Hard cap on a single frame, length field included. Anything larger is
/// treated as stream corruption.
const MAX_MESSAGE_LEN: u32 = 1 << 26;

/// Parameter value recorded for a NULL Bind entry. A text parameter whose
/// bytes spell `NULL` is indistinguishable from a true SQL NULL in the
/// reconstructed statement; output is for logs, so the ambiguity is accepted.
const NULL_SENTINEL: &[u8] = b"NULL";

struct PreparedStatement {
    template: String,
    /// Declared parameter type oids. Kept for completeness; formatting is
    /// driven by Bind format codes, not by these.
    #[allow(dead_code)]
    param_types: Vec<u32>,
}

struct Portal {
    statement: String,
    values: Vec<Vec<u8>>,
    /// Per-parameter format codes: 0 = text, 1 = binary.
    formats: Vec<u16>,
}

/// Streaming dissector for the client half of the PostgreSQL wire protocol.
/// One instance per connection. Fed raw client->server bytes, it frames
/// messages, tracks prepared statements and portals, and returns the SQL
/// text of every query the client asks the backend to run.
///
/// Only Q/P/B/E/C are interpreted; every other message type is framed and
/// skipped. The dissector never alters the byte stream it observes.
pub struct PgDissector {
    buf: BytesMut,
    startup_done: bool,
    statements: HashMap<String, PreparedStatement>,
    portals: HashMap<String, Portal>,
}

impl PgDissector {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(16384),
            startup_done: false,
            statements: HashMap::new(),
            portals: HashMap::new(),
        }
    }

    /// Consume a chunk of the client->server stream. Returns the SQL text of
    /// every query completed by this chunk, in stream order.
    pub fn feed(&mut self, data: &[u8]) -> Vec<String> {
        let mut queries = Vec::new();
        if data.is_empty() {
            return queries;
        }
        self.buf.extend_from_slice(data);
        self.process(&mut queries);
        queries
    }

    fn process(&mut self, queries: &mut Vec<String>) {
        // The first message on a connection has no type byte, just a length
        // covering itself. Skip it whole; the body (protocol version, user,
        // database, options) is not interesting here.
        if !self.startup_done {
            if self.buf.len() < 4 {
                return;
            }
            let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]);
            if len < 4 || len > MAX_MESSAGE_LEN {
                // Implausible startup length: assume the stream does not open
                // with a startup message and reframe the same bytes as
                // regular traffic, consuming nothing.
                self.startup_done = true;
            } else {
                if (self.buf.len() as u32) < len {
                    return;
                }
                let _ = self.buf.split_to(len as usize);
                self.startup_done = true;
            }
        }

        loop {
            if self.buf.len() < 5 {
                return;
            }
            let kind = self.buf[0];
            let len = u32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]);

            // len counts itself but not the type byte, so the smallest legal
            // value is 4 and the whole frame is len + 1 bytes.
            if len < 4 || len >= MAX_MESSAGE_LEN {
                warn!("implausible frame length {len} for type 0x{kind:02x}, resyncing");
                self.buf.clear();
                return;
            }

            let total = len as usize + 1;
            if self.buf.len() < total {
                return;
            }

            let frame = self.buf.split_to(total);
            match kind {
                b'Q' => self.on_query(&frame, queries),
                b'P' => {
                    self.on_parse(&frame);
                }
                b'B' => {
                    self.on_bind(&frame);
                }
                b'E' => {
                    self.on_execute(&frame, queries);
                }
                b'C' => {
                    self.on_close(&frame);
                }
                _ => {}
            }
        }
    }

    /// Simple Query: the body is one zero-terminated SQL string.
    fn on_query(&mut self, frame: &[u8], queries: &mut Vec<String>) {
        let body = &frame[5..];
        let body = match body.last() {
            Some(0) => &body[..body.len() - 1],
            _ => body,
        };
        let sql = String::from_utf8_lossy(body).into_owned();
        trace!("query: {sql}");
        queries.push(sql);
    }

    /// Parse: statement name, SQL template, declared parameter type oids.
    /// Re-parsing an existing name overwrites it, named or not.
    fn on_parse(&mut self, frame: &[u8]) -> Option<()> {
        let mut r = FrameReader::new(frame);
        let name = r.cstring();
        let template = r.cstring();

        let nparams = r.u16()?;
        let mut param_types = Vec::with_capacity(nparams as usize);
        for _ in 0..nparams {
            param_types.push(r.u32()?);
        }

        trace!("parse: stmt={name:?} template={template}");
        self.statements.insert(
            name,
            PreparedStatement {
                template,
                param_types,
            },
        );
        Some(())
    }

    /// Bind: pairs a statement with concrete parameter values under a portal
    /// name. A -1 value length means NULL. Result-column format codes belong
    /// to the backend and are only read to validate the frame.
    fn on_bind(&mut self, frame: &[u8]) -> Option<()> {
        let mut r = FrameReader::new(frame);
        let portal_name = r.cstring();
        let statement = r.cstring();

        let ncodes = r.u16()?;
        let mut codes = Vec::with_capacity(ncodes as usize);
        for _ in 0..ncodes {
            codes.push(r.u16()?);
        }

        let nparams = r.u16()?;
        let mut values = Vec::with_capacity(nparams as usize);
        let mut formats = Vec::with_capacity(nparams as usize);
        for i in 0..nparams as usize {
            let len = r.u32()? as i32;
            formats.push(param_format(&codes, i));
            if len == -1 {
                values.push(NULL_SENTINEL.to_vec());
            } else {
                if len < 0 {
                    return None;
                }
                values.push(r.take(len as usize)?.to_vec());
            }
        }

        let nresults = r.u16()?;
        r.take(2 * nresults as usize)?;

        trace!(
            "bind: portal={portal_name:?} stmt={statement:?} params={}",
            values.len()
        );
        self.portals.insert(
            portal_name,
            Portal {
                statement,
                values,
                formats,
            },
        );
        Some(())
    }

    /// Execute: resolve portal -> statement, splice the bound values into the
    /// template, emit. Unresolved lookups are dropped without comment; the
    /// backend will complain to the client on its own.
    fn on_execute(&mut self, frame: &[u8], queries: &mut Vec<String>) -> Option<()> {
        let mut r = FrameReader::new(frame);
        let portal_name = r.cstring();
        r.u32()?; // max_rows, irrelevant to reconstruction

        let portal = self.portals.get(&portal_name)?;
        let statement = self.statements.get(&portal.statement)?;
        let sql = splice_portal(&statement.template, portal);
        trace!("execute: portal={portal_name:?} sql={sql}");
        queries.push(sql);

        // The unnamed portal is single-shot; named portals survive and may
        // be re-executed.
        if portal_name.is_empty() {
            self.portals.remove(&portal_name);
        }
        Some(())
    }

    /// Close: drop a statement ('S') or portal ('P') by name.
    fn on_close(&mut self, frame: &[u8]) -> Option<()> {
        let mut r = FrameReader::new(frame);
        let target = r.u8()?;
        let name = r.cstring();
        match target {
            b'S' => {
                self.statements.remove(&name);
            }
            b'P' => {
                self.portals.remove(&name);
            }
            _ => {}
        }
        Some(())
    }
}

/// Cursor over one complete frame. Every read is bounds-checked against the
/// frame end; `None` makes the handler abandon the message, leaving any
/// half-assembled statement or portal unstored. The frame itself has already
/// been consumed by the framer, so the stream stays in sync.
struct FrameReader<'a> {
    frame: &'a [u8],
    pos: usize,
}

impl<'a> FrameReader<'a> {
    fn new(frame: &'a [u8]) -> Self {
        // Skip type byte and length.
        Self { frame, pos: 5 }
    }

    /// Zero-terminated string, lossily decoded. A missing terminator yields
    /// the rest of the frame and poisons the cursor so every later read
    /// fails.
    fn cstring(&mut self) -> String {
        if self.pos >= self.frame.len() {
            return String::new();
        }
        let rest = &self.frame[self.pos..];
        match rest.iter().position(|&b| b == 0) {
            Some(n) => {
                self.pos += n + 1;
                String::from_utf8_lossy(&rest[..n]).into_owned()
            }
            None => {
                self.pos = self.frame.len() + 1;
                String::from_utf8_lossy(rest).into_owned()
            }
        }
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn u16(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Option<u32> {
        self.take(4)
            .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.pos.checked_add(n)? > self.frame.len() {
            return None;
        }
        let b = &self.frame[self.pos..self.pos + n];
        self.pos += n;
        Some(b)
    }
}

/// Pick the format code for parameter `idx`: none declared means all text,
/// one declared applies to every parameter, otherwise positional with text
/// as the fallback.
fn param_format(codes: &[u16], idx: usize) -> u16 {
    match codes.len() {
        0 => 0,
        1 => codes[0],
        _ => codes.get(idx).copied().unwrap_or(0),
    }
}

/// Rebuild the SQL the backend will run by substituting `$N` placeholders in
/// the template with formatted parameter literals. A `$` not followed by an
/// in-range parameter number is copied verbatim.
fn splice_portal(template: &str, portal: &Portal) -> String {
    let bytes = template.as_bytes();
    let mut out = String::with_capacity(template.len() + portal.values.len() * 32);
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'$' {
            let mut j = i + 1;
            let mut num: usize = 0;
            let mut has_digit = false;
            while j < bytes.len() && bytes[j].is_ascii_digit() {
                has_digit = true;
                num = num.saturating_mul(10).saturating_add((bytes[j] - b'0') as usize);
                j += 1;
            }
            if has_digit && (1..=portal.values.len()).contains(&num) {
                let idx = num - 1;
                let code = portal.formats.get(idx).copied().unwrap_or(0);
                out.push_str(&format_literal(&portal.values[idx], code));
                i = j;
                continue;
            }
        }
        // Ordinary text, or a '$' with no usable parameter number: copy
        // through to the next '$'. '$' is ASCII, so slicing here cannot
        // split a UTF-8 sequence.
        let next = bytes[i + 1..]
            .iter()
            .position(|&b| b == b'$')
            .map(|n| i + 1 + n)
            .unwrap_or(bytes.len());
        out.push_str(&template[i..next]);
        i = next;
    }

    out
}

/// Format one bound value as a SQL literal. Numeric-looking text goes in
/// bare; the classification is deliberately loose, since the output feeds a
/// log, not a database.
fn format_literal(value: &[u8], format_code: u16) -> String {
    if value == NULL_SENTINEL {
        return "NULL".to_string();
    }
    if format_code == 1 {
        return format!("E'\\\\x{}'::bytea", hex::encode(value));
    }
    if is_integer_literal(value) || is_float_literal(value) {
        return String::from_utf8_lossy(value).into_owned();
    }
    quote_string(value)
}

fn is_integer_literal(s: &[u8]) -> bool {
    let digits = match s {
        [] => return false,
        [b'+' | b'-', rest @ ..] => rest,
        _ => s,
    };
    !digits.is_empty() && digits.iter().all(|b| b.is_ascii_digit())
}

/// Decimal or exponential float: at least one mantissa digit, at most one
/// dot, at most one exponent with an optional sign and mandatory digits.
fn is_float_literal(s: &[u8]) -> bool {
    let s = match s {
        [] => return false,
        [b'+' | b'-', rest @ ..] => {
            if rest.is_empty() {
                return false;
            }
            rest
        }
        _ => s,
    };

    let mut seen_digit = false;
    let mut seen_dot = false;
    let mut seen_exp = false;
    let mut i = 0;

    while i < s.len() {
        let b = s[i];
        if b.is_ascii_digit() {
            seen_digit = true;
        } else if b == b'.' {
            if seen_dot || seen_exp {
                return false;
            }
            seen_dot = true;
        } else if b == b'e' || b == b'E' {
            if seen_exp || !seen_digit {
                return false;
            }
            seen_exp = true;
            seen_digit = false;
            if i + 1 < s.len() && (s[i + 1] == b'+' || s[i + 1] == b'-') {
                i += 1;
            }
        } else {
            return false;
        }
        i += 1;
    }

    seen_digit && (seen_dot || seen_exp)
}

/// Single-quoted SQL string with embedded quotes doubled. No backslash or
/// control-character escaping; reconstructed text reaches the log exactly as
/// the client sent it.
fn quote_string(value: &[u8]) -> String {
    let text = String::from_utf8_lossy(value);
    let mut out = String::with_capacity(text.len() + 2);
    out.push('\'');
    for c in text.chars() {
        if c == '\'' {
            out.push('\'');
        }
        out.push(c);
    }
    out.push('\'');
    out
}
