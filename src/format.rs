//! Text and JSON rendering of endpoint readings
//!
//! The text layout is column-compatible with the `/proc` files:
//!
//! ```text
//! currentime:  0x%08lx 0x%016Lx %10i.%06i
//!              %40i.%09i
//! jitbusy...:  %9li %9li
//! jitimer...:     time   delta  inirq    pid   cpu command
//!              %9li  %3li     %i    %6i   %i   %s
//! ```

use crate::cli::OutputFormat;
use crate::collector::TraceRecord;
use crate::delay::DelaySample;
use crate::module::{Reading, TimeSample};

/// Header line of every trace endpoint
pub const TRACE_HEADER: &str = "   time   delta  inirq    pid   cpu command\n";

/// Render `reading` in the requested format
///
/// JSON readings are one compact document per line.
pub fn render(reading: &Reading, format: OutputFormat) -> serde_json::Result<String> {
    match format {
        OutputFormat::Text => Ok(render_text(reading)),
        OutputFormat::Json => {
            let mut line = serde_json::to_string(reading)?;
            line.push('\n');
            Ok(line)
        }
    }
}

/// Render `reading` in the `/proc` text layout
pub fn render_text(reading: &Reading) -> String {
    match reading {
        Reading::Time(sample) => format_time(sample),
        Reading::Delay(sample) => format_delay(sample),
        Reading::Trace(report) => format_trace(&report.records),
    }
}

/// Two lines: tick counters with precise wall clock, then coarse wall clock
pub fn format_time(sample: &TimeSample) -> String {
    format!(
        "0x{:08x} 0x{:016x} {:>10}.{:06}\n{:>40}.{:09}\n",
        sample.ticks32,
        sample.ticks64,
        sample.wall.secs,
        sample.wall.micros(),
        sample.coarse.secs,
        sample.coarse.nanos
    )
}

/// One line: start and end ticks
///
/// # Example
/// ```
/// use jitprobe::delay::DelaySample;
/// use jitprobe::format::format_delay;
///
/// let line = format_delay(&DelaySample { start: 1000, end: 1250 });
/// assert_eq!(line, "     1000      1250\n");
/// ```
pub fn format_delay(sample: &DelaySample) -> String {
    format!("{:>9} {:>9}\n", sample.start, sample.end)
}

/// One trace line
pub fn format_record(record: &TraceRecord) -> String {
    format!(
        "{:>9}  {:>3}     {}    {:>6}   {}   {}\n",
        record.ticks,
        record.delta,
        u8::from(record.in_interrupt),
        record.pid,
        record.cpu,
        record.command
    )
}

/// Header plus one line per record
pub fn format_trace(records: &[TraceRecord]) -> String {
    let mut out = String::with_capacity(TRACE_HEADER.len() * (records.len() + 1));
    out.push_str(TRACE_HEADER);
    for record in records {
        out.push_str(&format_record(record));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::WallTime;
    use crate::collector::TraceVariant;
    use crate::module::TraceReport;

    fn record(ticks: u64, delta: u64, irq: bool) -> TraceRecord {
        TraceRecord {
            ticks,
            delta,
            in_interrupt: irq,
            pid: 4242,
            cpu: 1,
            command: "cat".to_string(),
            nanos: ticks * 1_000_000,
        }
    }

    #[test]
    fn test_format_record_columns() {
        let line = format_record(&record(123456, 10, true));
        assert_eq!(line, "   123456   10     1      4242   1   cat\n");
    }

    #[test]
    fn test_format_trace_header_and_lines() {
        let records = vec![record(100, 0, false), record(110, 10, true)];
        let text = format_trace(&records);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], TRACE_HEADER.trim_end());
        assert!(lines[1].contains("     0    "));
    }

    #[test]
    fn test_format_time() {
        let sample = TimeSample {
            ticks32: 0x1234,
            ticks64: 0x1_0000_1234,
            wall: WallTime {
                secs: 1_700_000_000,
                nanos: 123_456_789,
            },
            coarse: WallTime {
                secs: 1_700_000_000,
                nanos: 120_000_000,
            },
        };
        let text = format_time(&sample);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "0x00001234 0x0000000100001234 1700000000.123456");
        assert_eq!(lines[1].len(), 50);
        assert!(lines[1].ends_with("1700000000.120000000"));
    }

    #[test]
    fn test_render_json_is_one_line() {
        let reading = Reading::Trace(TraceReport {
            variant: TraceVariant::TaskletHigh,
            records: vec![record(1, 0, false)],
        });
        let out = render(&reading, OutputFormat::Json).unwrap();
        assert!(out.ends_with('\n'));
        assert_eq!(out.lines().count(), 1);
        let value: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["kind"], "trace");
        assert_eq!(value["variant"], "tasklet_high");
    }

    #[test]
    fn test_render_text_delay() {
        let reading = Reading::Delay(DelaySample { start: 5, end: 6 });
        assert_eq!(
            render(&reading, OutputFormat::Text).unwrap(),
            "        5         6\n"
        );
    }
}
