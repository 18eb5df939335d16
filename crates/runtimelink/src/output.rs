use std::io::{IsTerminal, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

/// Something a command reports on stdout.
pub trait Record: Serialize {
    /// Column name and rendered value, in display order.
    fn fields(&self) -> Vec<(&'static str, String)>;

    /// Bytes written for `--format raw`.
    fn raw(&self) -> Vec<u8>;
}

/// A server that is ready for peers.
#[derive(Serialize)]
pub struct Endpoint<'a> {
    pub transport: &'a str,
    pub host: Option<String>,
    pub port: u16,
    pub identifier: Option<&'a str>,
}

impl Record for Endpoint<'_> {
    fn fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("TRANSPORT", self.transport.to_string()),
            ("HOST", self.host.clone().unwrap_or_else(|| "-".to_string())),
            ("PORT", self.port.to_string()),
            ("IDENTIFIER", self.identifier.unwrap_or("-").to_string()),
        ]
    }

    fn raw(&self) -> Vec<u8> {
        format!("{}\n", self.port).into_bytes()
    }
}

/// A reply received by `send --wait`.
#[derive(Serialize)]
pub struct Reply<'a> {
    pub identifier: &'a str,
    pub payload: serde_json::Value,
    pub peer: &'a str,
    pub timestamp: String,
}

impl<'a> Reply<'a> {
    pub fn new(identifier: &'a str, payload: serde_json::Value, peer: &'a str) -> Self {
        Self {
            identifier,
            payload,
            peer,
            timestamp: now_unix_seconds(),
        }
    }
}

impl Record for Reply<'_> {
    fn fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("IDENTIFIER", self.identifier.to_string()),
            ("PEER", self.peer.to_string()),
            ("PAYLOAD", self.payload.to_string()),
        ]
    }

    fn raw(&self) -> Vec<u8> {
        let mut bytes = self.payload.to_string().into_bytes();
        bytes.push(b'\n');
        bytes
    }
}

/// A port read from a port file.
#[derive(Serialize)]
pub struct Discovered<'a> {
    pub identifier: &'a str,
    pub port: u16,
    pub path: String,
}

impl Record for Discovered<'_> {
    fn fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("IDENTIFIER", self.identifier.to_string()),
            ("PORT", self.port.to_string()),
            ("PATH", self.path.clone()),
        ]
    }

    fn raw(&self) -> Vec<u8> {
        format!("{}\n", self.port).into_bytes()
    }
}

pub fn print_record<R: Record>(record: &R, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string(record).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let (header, row): (Vec<_>, Vec<_>) = record.fields().into_iter().unzip();
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(header)
                .add_row(row);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            let line = record
                .fields()
                .into_iter()
                .map(|(name, value)| format!("{}={value}", name.to_lowercase()))
                .collect::<Vec<_>>()
                .join(" ");
            println!("{line}");
        }
        OutputFormat::Raw => print_raw(&record.raw()),
    }
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

fn now_unix_seconds() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}
