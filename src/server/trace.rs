//! Packet-level tracing via the `tracing` crate.
//!
//! Ported from `trace.c`. Each direction (`Rx`/`Tx`) carries its own set of
//! per-item levels, an extension include/exclude filter, and a size cap
//! beyond which the whole connection is marked disabled (`trace->disable`,
//! set once a response has grown past `trace->size`). `should_trace` answers
//! "would this be emitted", the same question `httpShouldTrace` answers
//! before a caller bothers building the line to log. Binary content is
//! hex-dumped at 16 bytes per line like `traceBuf`'s digit table.

use crate::pipeline::packet::{Packet, PacketContent};
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction { Rx, Tx }

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceItem { Conn, First, Header, Body, Limits, Time }

impl TraceItem {
    const ALL: [TraceItem; 6] = [
        TraceItem::Conn,
        TraceItem::First,
        TraceItem::Header,
        TraceItem::Body,
        TraceItem::Limits,
        TraceItem::Time,
    ];

    fn default_level(self) -> i8 {
        match self {
            TraceItem::Conn => 3,
            TraceItem::First => 2,
            TraceItem::Header => 3,
            TraceItem::Body => 4,
            TraceItem::Limits => 5,
            TraceItem::Time => 6,
        }
    }
}

/// Per-direction trace configuration. Mirrors `HttpTrace`: a level per item,
/// an optional include/exclude extension filter, and a byte-size cap after
/// which the whole trace disables itself for the rest of the connection.
#[derive(Debug, Clone)]
pub struct TraceConfig {
    levels: [i8; 6],
    include: Option<HashSet<String>>,
    exclude: Option<HashSet<String>>,
    size_cap: Option<u64>,
    disabled: bool,
}

impl Default for TraceConfig {
    fn default() -> Self {
        let mut levels = [0i8; 6];
        for item in TraceItem::ALL {
            levels[item as usize] = item.default_level();
        }
        Self {
            levels,
            include: None,
            exclude: None,
            size_cap: None,
            disabled: false,
        }
    }
}

impl TraceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_level(mut self, item: TraceItem, level: i8) -> Self {
        self.levels[item as usize] = level;
        self
    }

    pub fn with_size_cap(mut self, bytes: u64) -> Self {
        self.size_cap = Some(bytes);
        self
    }

    pub fn include(mut self, extensions: impl IntoIterator<Item = &'static str>) -> Self {
        self.include = Some(extensions.into_iter().map(String::from).collect());
        self
    }

    pub fn exclude(mut self, extensions: impl IntoIterator<Item = &'static str>) -> Self {
        self.exclude = Some(extensions.into_iter().map(String::from).collect());
        self
    }

    /// Returns the level to trace at, or `None` if tracing is suppressed —
    /// either because the connection has disabled itself, or this
    /// extension is filtered out. Matches `httpShouldTrace`, except the
    /// caller's ambient log level is whatever `tracing` subscriber is
    /// installed rather than a global `MPR->logLevel` check here.
    pub fn should_trace(&self, item: TraceItem, ext: Option<&str>) -> Option<i8> {
        if self.disabled {
            return None;
        }
        if let Some(ext) = ext {
            if let Some(include) = &self.include {
                if !include.contains(ext) {
                    return None;
                }
            }
            if let Some(exclude) = &self.exclude {
                if exclude.contains(ext) {
                    return None;
                }
            }
        }
        Some(self.levels[item as usize])
    }

    /// Marks the trace permanently disabled once a response has exceeded
    /// the configured size cap. Matches `trace->disable = 1` in
    /// `httpTraceContent`.
    pub fn disable(&mut self) {
        self.disabled = true;
    }

    pub fn over_size_cap(&self, total: u64) -> bool {
        matches!(self.size_cap, Some(cap) if total >= cap)
    }

    /// Traces a packet's prefix and content, abbreviating past `max_body`
    /// and disabling the trace for the rest of the connection once `total`
    /// exceeds the configured size cap. Matches `httpTraceContent`.
    pub fn trace_content(
        &mut self,
        dir: Direction,
        item: TraceItem,
        packet: &Packet,
        conn_seq: u64,
        total: u64,
        max_body: usize,
    ) {
        if self.over_size_cap(total) {
            self.disable();
            return;
        }
        let Some(level) = self.should_trace(item, None) else {
            return;
        };
        if let Some(prefix) = &packet.prefix {
            trace_buf(dir, level, "prefix", prefix, conn_seq, max_body);
        }
        if let PacketContent::Buffered(content) = &packet.content {
            if !content.is_empty() {
                trace_buf(dir, level, "content", content, conn_seq, max_body);
            }
        }
    }
}

fn tag(dir: Direction) -> &'static str {
    match dir {
        Direction::Tx => "Transmit",
        Direction::Rx => "Receive",
    }
}

/// Emits one packet's bytes, printable text verbatim or abbreviated binary
/// hex, at the resolved `level`. Mirrors `traceBuf`.
fn trace_buf(dir: Direction, level: i8, msg: &str, buf: &[u8], conn_seq: u64, max_body: usize) {
    let printable = buf
        .iter()
        .all(|&b| b.is_ascii_graphic() || b == b' ' || b == b'\n' || b == b'\r' || b == b'\t');

    let (shown, truncated) = if buf.len() > max_body {
        (&buf[..max_body], buf.len() - max_body)
    } else {
        (buf, 0)
    };

    if printable {
        let text = String::from_utf8_lossy(shown);
        tracing::event!(
            tracing::Level::TRACE,
            tag = tag(dir),
            msg,
            conn = conn_seq,
            level,
            "{text}"
        );
    } else {
        tracing::event!(
            tracing::Level::TRACE,
            tag = tag(dir),
            msg,
            conn = conn_seq,
            level,
            "{}",
            hex_dump(shown)
        );
    }
    if truncated > 0 {
        tracing::event!(
            tracing::Level::TRACE,
            "... {truncated} more bytes"
        );
    }
}

/// 16-bytes-per-line hex dump, matching `traceBuf`'s digit table.
fn hex_dump(buf: &[u8]) -> String {
    let mut out = String::with_capacity(buf.len() * 3);
    for (i, byte) in buf.iter().enumerate() {
        out.push_str(&format!("{byte:02X} "));
        if (i + 1) % 16 == 0 {
            out.push('\n');
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_levels_match_the_original_table() {
        let cfg = TraceConfig::new();
        assert_eq!(cfg.should_trace(TraceItem::Conn, None), Some(3));
        assert_eq!(cfg.should_trace(TraceItem::First, None), Some(2));
        assert_eq!(cfg.should_trace(TraceItem::Header, None), Some(3));
        assert_eq!(cfg.should_trace(TraceItem::Body, None), Some(4));
        assert_eq!(cfg.should_trace(TraceItem::Limits, None), Some(5));
        assert_eq!(cfg.should_trace(TraceItem::Time, None), Some(6));
    }

    #[test]
    fn include_filter_suppresses_unlisted_extensions() {
        let cfg = TraceConfig::new().include(["html", "json"]);
        assert!(cfg.should_trace(TraceItem::Body, Some("html")).is_some());
        assert!(cfg.should_trace(TraceItem::Body, Some("png")).is_none());
    }

    #[test]
    fn exclude_filter_suppresses_listed_extensions() {
        let cfg = TraceConfig::new().exclude(["png", "jpg"]);
        assert!(cfg.should_trace(TraceItem::Body, Some("png")).is_none());
        assert!(cfg.should_trace(TraceItem::Body, Some("html")).is_some());
    }

    #[test]
    fn disabling_suppresses_every_item() {
        let mut cfg = TraceConfig::new();
        cfg.disable();
        assert!(cfg.should_trace(TraceItem::Conn, None).is_none());
    }

    #[test]
    fn trace_content_disables_once_past_the_size_cap() {
        let mut cfg = TraceConfig::new().with_size_cap(100);
        let packet = Packet::create_data(b"hello".to_vec());
        cfg.trace_content(Direction::Tx, TraceItem::Body, &packet, 1, 200, 2048);
        assert!(cfg.should_trace(TraceItem::Body, None).is_none());
    }

    #[test]
    fn hex_dump_wraps_every_sixteen_bytes() {
        let dump = hex_dump(&[0u8; 17]);
        assert_eq!(dump.matches('\n').count(), 1);
    }
}
