// Dividat Driver Rust Source Code File - See https://dividat.com for more info.
//
// Copyright 2016-2024 Dividat AG. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! Recording line codec. A recording is UTF-8 text, one record per line:
//! `<sleep_ms>,<base64_payload>`. The replayer sleeps the recorded delay
//! (scaled by a speed factor) and hands the decoded payload to a writer
//! channel, typically the feed side of a virtual TTY.

use base64::{Engine as _, engine::general_purpose::STANDARD};
use getset::{CopyGetters, Getters};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::errors::DriverError;

#[derive(Debug, Clone, PartialEq, Eq, Getters, CopyGetters)]
pub struct Record {
  /// Delay before this payload is written, in milliseconds.
  #[getset(get_copy = "pub")]
  sleep_ms: u64,
  #[getset(get = "pub")]
  payload: Vec<u8>,
}

impl Record {
  pub fn new(sleep_ms: u64, payload: Vec<u8>) -> Self {
    Self { sleep_ms, payload }
  }
}

/// Parses one recording line. `line_number` is used for error reporting only.
pub fn parse_line(line: &str, line_number: usize) -> Result<Record, DriverError> {
  let malformed = || DriverError::MalformedRecordingLine(line_number, line.to_owned());
  let (sleep, payload) = line.split_once(',').ok_or_else(malformed)?;
  let sleep_ms = sleep.parse::<u64>().map_err(|_| malformed())?;
  let payload = STANDARD.decode(payload.trim_end()).map_err(|_| malformed())?;
  Ok(Record::new(sleep_ms, payload))
}

pub fn format_line(record: &Record) -> String {
  format!("{},{}", record.sleep_ms, STANDARD.encode(&record.payload))
}

/// Parses a whole recording, skipping blank lines.
pub fn parse(contents: &str) -> Result<Vec<Record>, DriverError> {
  contents
    .lines()
    .enumerate()
    .filter(|(_, line)| !line.trim().is_empty())
    .map(|(number, line)| parse_line(line, number + 1))
    .collect()
}

/// Replays records into `sink`, sleeping each recorded delay divided by
/// `speed`. Stops early if the sink is dropped.
pub async fn replay(records: &[Record], speed: f64, sink: mpsc::Sender<Vec<u8>>) {
  for record in records {
    let delay = (record.sleep_ms as f64 / speed).round() as u64;
    tokio::time::sleep(Duration::from_millis(delay)).await;
    if sink.send(record.payload.clone()).await.is_err() {
      debug!("Replay sink dropped, stopping replay");
      return;
    }
  }
}

#[cfg(test)]
mod test {
  use super::*;

  const LINE: &str = "250,Tg0=";

  #[test]
  fn test_line_roundtrip() {
    let record = parse_line(LINE, 1).expect("Valid recording line");
    assert_eq!(record.sleep_ms(), 250);
    assert_eq!(record.payload(), &vec![b'N', b'\r']);
    assert_eq!(format_line(&record), LINE);
  }

  #[test]
  fn test_malformed_lines_rejected() {
    assert!(parse_line("no-comma", 1).is_err());
    assert!(parse_line("x,Tg0=", 1).is_err());
    assert!(parse_line("250,not base64!", 1).is_err());
  }

  #[test]
  fn test_parse_skips_blank_lines() {
    let records = parse("100,Tg0=\n\n200,Tg0=\n").expect("Valid recording");
    assert_eq!(records.len(), 2);
    assert_eq!(records[1].sleep_ms(), 200);
  }

  #[tokio::test(start_paused = true)]
  async fn test_replay_scales_sleep_and_delivers() {
    let records = vec![
      Record::new(100, vec![1, 2]),
      Record::new(300, vec![3]),
    ];
    let (sender, mut receiver) = mpsc::channel(4);
    let started = tokio::time::Instant::now();
    replay(&records, 2.0, sender).await;
    assert_eq!(receiver.recv().await, Some(vec![1, 2]));
    assert_eq!(receiver.recv().await, Some(vec![3]));
    assert_eq!(receiver.recv().await, None);
    // 100ms + 300ms at double speed.
    assert_eq!(started.elapsed(), Duration::from_millis(200));
  }
}
