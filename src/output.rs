use prettytable::Cell;
use prettytable::Row;
use prettytable::Table;
use prettytable::row;
use serde_json::json;
use std::fmt;
use std::io::Write;

use crate::error::TraceError;
use crate::hop::HopResult;
use crate::trace::TraceOutcome;
use crate::trace::TraceSession;

/// Receives hops as the trace walks the path. A hop is handed over by value
/// and is gone once the sink returns, unless the sink keeps it.
pub trait HopSink {
    fn begin(&mut self, _session: &TraceSession) -> Result<(), TraceError> {
        Ok(())
    }
    fn hop(&mut self, hop: HopResult) -> Result<(), TraceError>;
    fn finish(&mut self, _outcome: &TraceOutcome) -> Result<(), TraceError> {
        Ok(())
    }
}

fn responder_str(hop: &HopResult) -> Option<String> {
    let addr = hop.responder?;
    Some(match &hop.hostname {
        Some(name) => format!("{} ({})", name, addr),
        None => format!("{}", addr),
    })
}

/// One console line for `hop`.
///
/// ` 3 1.52 ms  *  2.03 ms 10.0.0.1`, or ` 3 Request timed out.` when no
/// attempt got an answer.
pub fn format_hop_line(hop: &HopResult) -> String {
    match responder_str(hop) {
        Some(responder) => {
            let times: Vec<String> = hop
                .attempts
                .iter()
                .map(|a| match a.rtt_ms() {
                    Some(rtt) => format!("{:.2} ms", rtt),
                    None => String::from("*"),
                })
                .collect();
            format!("{:>2} {} {}", hop.hop, times.join("  "), responder)
        }
        None => format!("{:>2} Request timed out.", hop.hop),
    }
}

pub struct TextOutput<W: Write> {
    writer: W,
}

impl<W: Write> TextOutput<W> {
    pub fn new(writer: W) -> TextOutput<W> {
        TextOutput { writer }
    }
    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> HopSink for TextOutput<W> {
    fn begin(&mut self, session: &TraceSession) -> Result<(), TraceError> {
        writeln!(
            self.writer,
            "Tracing route to {} with a maximum of {} hops:",
            session.destination, session.config.max_hops
        )?;
        Ok(())
    }
    fn hop(&mut self, hop: HopResult) -> Result<(), TraceError> {
        writeln!(self.writer, "{}", format_hop_line(&hop))?;
        self.writer.flush()?;
        Ok(())
    }
}

/// Newline delimited JSON, one object per hop and a closing summary.
pub struct JsonOutput<W: Write> {
    writer: W,
}

impl<W: Write> JsonOutput<W> {
    pub fn new(writer: W) -> JsonOutput<W> {
        JsonOutput { writer }
    }
    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> HopSink for JsonOutput<W> {
    fn begin(&mut self, session: &TraceSession) -> Result<(), TraceError> {
        let start = json!({
            "destination": session.destination,
            "config": session.config,
        });
        serde_json::to_writer(&mut self.writer, &start)?;
        writeln!(self.writer)?;
        Ok(())
    }
    fn hop(&mut self, hop: HopResult) -> Result<(), TraceError> {
        serde_json::to_writer(&mut self.writer, &hop)?;
        writeln!(self.writer)?;
        self.writer.flush()?;
        Ok(())
    }
    fn finish(&mut self, outcome: &TraceOutcome) -> Result<(), TraceError> {
        serde_json::to_writer(&mut self.writer, outcome)?;
        writeln!(self.writer)?;
        self.writer.flush()?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct TableRow {
    hop: u8,
    responder: String,
    loss: f64,
    best: Option<f64>,
    avg: Option<f64>,
    worst: Option<f64>,
}

impl TableRow {
    fn from_hop(hop: &HopResult) -> TableRow {
        let rtts: Vec<f64> = hop.attempts.iter().filter_map(|a| a.rtt_ms()).collect();
        let (best, avg, worst) = if rtts.is_empty() {
            (None, None, None)
        } else {
            let best = rtts.iter().copied().fold(f64::INFINITY, f64::min);
            let worst = rtts.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let avg = rtts.iter().sum::<f64>() / rtts.len() as f64;
            (Some(best), Some(avg), Some(worst))
        };
        TableRow {
            hop: hop.hop,
            responder: responder_str(hop).unwrap_or_else(|| String::from("*")),
            loss: hop.loss(),
            best,
            avg,
            worst,
        }
    }
}

fn ms_str(v: Option<f64>) -> String {
    match v {
        Some(v) => format!("{:.2}", v),
        None => String::from("-"),
    }
}

/// Summary table printed after the trace.
#[derive(Debug, Clone, Default)]
pub struct TableOutput {
    rows: Vec<TableRow>,
    outcome: Option<TraceOutcome>,
}

impl TableOutput {
    pub fn new() -> TableOutput {
        TableOutput::default()
    }
    pub fn len(&self) -> usize {
        self.rows.len()
    }
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl HopSink for TableOutput {
    fn hop(&mut self, hop: HopResult) -> Result<(), TraceError> {
        self.rows.push(TableRow::from_hop(&hop));
        Ok(())
    }
    fn finish(&mut self, outcome: &TraceOutcome) -> Result<(), TraceError> {
        self.outcome = Some(*outcome);
        Ok(())
    }
}

impl fmt::Display for TableOutput {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut table = Table::new();
        table.add_row(Row::new(vec![
            Cell::new("Trace Results").style_spec("c").with_hspan(6),
        ]));
        table.add_row(row![c -> "hop", c -> "address", c -> "loss", c -> "best", c -> "avg", c -> "worst"]);
        for r in &self.rows {
            let loss_str = format!("{:.0}%", r.loss * 100.0);
            table.add_row(row![
                c -> r.hop,
                c -> r.responder,
                c -> loss_str,
                c -> ms_str(r.best),
                c -> ms_str(r.avg),
                c -> ms_str(r.worst)
            ]);
        }
        if let Some(outcome) = &self.outcome {
            let summary = format!("Summary: {}", outcome);
            table.add_row(Row::new(vec![Cell::new(&summary).with_hspan(6)]));
        }
        write!(f, "{}", table)
    }
}

/// Feed every event to two sinks.
pub struct Tee<A: HopSink, B: HopSink> {
    pub first: A,
    pub second: B,
}

impl<A: HopSink, B: HopSink> Tee<A, B> {
    pub fn new(first: A, second: B) -> Tee<A, B> {
        Tee { first, second }
    }
}

impl<A: HopSink, B: HopSink> HopSink for Tee<A, B> {
    fn begin(&mut self, session: &TraceSession) -> Result<(), TraceError> {
        self.first.begin(session)?;
        self.second.begin(session)
    }
    fn hop(&mut self, hop: HopResult) -> Result<(), TraceError> {
        self.first.hop(hop.clone())?;
        self.second.hop(hop)
    }
    fn finish(&mut self, outcome: &TraceOutcome) -> Result<(), TraceError> {
        self.first.finish(outcome)?;
        self.second.finish(outcome)
    }
}
