//! mbctl - command line front-end for the microbeam daemon
//!
//! Talks JSON lines to the control socket and can follow the subscriber
//! stream, optionally playing the acknowledging primary subscriber.
//!
//! # Usage
//!
//! ```text
//! mbctl status
//! mbctl write-dac 100 -200 --units lsb
//! mbctl start --x -1000:1000:21 --y -1000:1000:21 --hits 10 --timeout 2
//! mbctl poll --follow
//! mbctl stop
//! mbctl listen --ack --ack-after-ms 500
//! ```

use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::sleep;

use microbeam_core::{RunState, RunStatus, ScanParameters, ScanUnit};
use microbeam_protocol::{ControlRequest, ControlResponse, PollReport, SubscriberMessage, ACK};
use microbeamd::config::{DEFAULT_CONTROL_ADDR, DEFAULT_SUBSCRIBER_ADDR};

// ============================================================================
// CLI Arguments
// ============================================================================

/// Microbeam control client
#[derive(Parser, Debug)]
#[command(name = "mbctl", version, about)]
struct Args {
    /// Control socket address
    #[arg(long, global = true, env = "MICROBEAM_CONTROL")]
    control: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show controller state and counters
    Status,
    /// Position the beam (only while idle)
    WriteDac {
        #[arg(allow_hyphen_values = true)]
        x: f64,
        #[arg(allow_hyphen_values = true)]
        y: f64,
        /// lsb, volt or um
        #[arg(long, default_value = "lsb")]
        units: ScanUnit,
    },
    /// Start a raster scan
    Start {
        /// X axis as start:stop:points
        #[arg(long, allow_hyphen_values = true)]
        x: AxisRange,
        /// Y axis as start:stop:points
        #[arg(long, allow_hyphen_values = true)]
        y: AxisRange,
        /// Hits to collect per point
        #[arg(long, default_value_t = 1)]
        hits: u32,
        /// Seconds per point, 0 waits for the hits forever
        #[arg(long, default_value_t = 0.0)]
        timeout: f64,
        #[arg(long, default_value_t = 1)]
        repeat: u32,
        /// lsb, volt or um
        #[arg(long, default_value = "lsb")]
        units: ScanUnit,
    },
    /// Stop the active run and wait until it has unwound
    Stop,
    /// Print hits not seen yet
    Poll {
        /// Keep polling until the run ends
        #[arg(short, long)]
        follow: bool,
        /// Poll interval in milliseconds
        #[arg(long, default_value_t = 200)]
        interval_ms: u64,
    },
    /// Follow the subscriber stream
    Listen {
        /// Subscriber socket address
        #[arg(long, default_value = DEFAULT_SUBSCRIBER_ADDR)]
        addr: String,
        /// Answer every position with an ack
        #[arg(long)]
        ack: bool,
        /// Delay before each ack
        #[arg(long, default_value_t = 1000)]
        ack_after_ms: u64,
    },
}

/// `start:stop:points` on one axis.
#[derive(Debug, Clone, Copy)]
struct AxisRange {
    start: f64,
    stop: f64,
    points: u32,
}

impl std::str::FromStr for AxisRange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        let [start, stop, points] = parts.as_slice() else {
            return Err(format!("expected start:stop:points, got '{s}'"));
        };
        Ok(Self {
            start: start.parse().map_err(|e| format!("start '{start}': {e}"))?,
            stop: stop.parse().map_err(|e| format!("stop '{stop}': {e}"))?,
            points: points.parse().map_err(|e| format!("points '{points}': {e}"))?,
        })
    }
}

// ============================================================================
// Control Client
// ============================================================================

struct ControlClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl ControlClient {
    async fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("Failed to connect to the daemon at {addr}"))?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(reader),
            writer,
        })
    }

    async fn request(&mut self, request: &ControlRequest) -> Result<ControlResponse> {
        let mut json = serde_json::to_string(request)?;
        json.push('\n');
        self.writer.write_all(json.as_bytes()).await?;

        let mut line = String::new();
        if self.reader.read_line(&mut line).await? == 0 {
            bail!("Daemon closed the connection");
        }
        let response: ControlResponse =
            serde_json::from_str(&line).context("Malformed response from daemon")?;
        match response {
            ControlResponse::Error { message } => bail!("{message}"),
            other => Ok(other),
        }
    }

    async fn poll(&mut self) -> Result<PollReport> {
        match self.request(&ControlRequest::Poll).await? {
            ControlResponse::Poll(report) => Ok(report),
            other => bail!("Unexpected response: {other:?}"),
        }
    }

    async fn status(&mut self) -> Result<RunStatus> {
        match self.request(&ControlRequest::Status).await? {
            ControlResponse::Status(status) => Ok(status),
            other => bail!("Unexpected response: {other:?}"),
        }
    }
}

fn print_status(status: &RunStatus) {
    println!("State:        {}", status.state);
    match status.run_id {
        Some(id) => println!("Run:          {id}"),
        None => println!("Run:          -"),
    }
    println!("DAC:          {} {}", status.dac.x, status.dac.y);
    println!(
        "Points:       {} / {}",
        status.scan_points_done, status.scan_points
    );
    println!("Hits:         {}", status.hit_count);
    println!("Timeouts:     {}", status.timeout_counter);
    println!("Latch-ups:    {}", status.latch_counter);
}

fn print_hits(report: &PollReport) {
    for hit in &report.new_hits {
        println!("hit {} {}", hit.x, hit.y);
    }
}

// ============================================================================
// Subscriber
// ============================================================================

async fn listen(addr: &str, ack: bool, ack_after: Duration) -> Result<()> {
    let stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("Failed to connect to the subscriber socket at {addr}"))?;
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        println!("{line}");
        if !ack {
            continue;
        }
        match line.parse::<SubscriberMessage>() {
            Ok(SubscriberMessage::Pos(_)) => {
                sleep(ack_after).await;
                writer.write_all(format!("{ACK}\n").as_bytes()).await?;
            }
            Ok(_) => {}
            Err(e) => eprintln!("warning: {e}"),
        }
    }

    println!("Subscriber stream closed.");
    Ok(())
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let control = args
        .control
        .unwrap_or_else(|| DEFAULT_CONTROL_ADDR.replace("0.0.0.0", "127.0.0.1"));

    match args.command {
        Command::Status => {
            let mut client = ControlClient::connect(&control).await?;
            print_status(&client.status().await?);
        }
        Command::WriteDac { x, y, units } => {
            let mut client = ControlClient::connect(&control).await?;
            client
                .request(&ControlRequest::WriteDac {
                    dac_x: x,
                    dac_y: y,
                    units,
                })
                .await?;
            let status = client.status().await?;
            println!("DAC set to {} {}", status.dac.x, status.dac.y);
        }
        Command::Start {
            x,
            y,
            hits,
            timeout,
            repeat,
            units,
        } => {
            let params = ScanParameters {
                start_x: x.start,
                start_y: y.start,
                stop_x: x.stop,
                stop_y: y.stop,
                points_x: x.points,
                points_y: y.points,
                hits_per_step: hits,
                step_timeout: timeout,
                repeat_count: repeat,
                unit: units,
            };
            let mut client = ControlClient::connect(&control).await?;
            client.request(&ControlRequest::StartRun(params)).await?;
            let status = client.status().await?;
            match status.run_id {
                Some(id) => println!("Run {id} started, {} points.", status.scan_points),
                None => println!("Run started."),
            }
        }
        Command::Stop => {
            let mut client = ControlClient::connect(&control).await?;
            client.request(&ControlRequest::StopRun).await?;
            println!("Run stopped.");
        }
        Command::Poll {
            follow,
            interval_ms,
        } => {
            let mut client = ControlClient::connect(&control).await?;
            loop {
                let report = client.poll().await?;
                print_hits(&report);
                if !follow || report.state == RunState::Idle {
                    println!(
                        "{}: {} / {} points, DAC {} {}",
                        report.state,
                        report.scan_points_done,
                        report.scan_points,
                        report.dac_x,
                        report.dac_y
                    );
                    break;
                }
                sleep(Duration::from_millis(interval_ms)).await;
            }
        }
        Command::Listen {
            addr,
            ack,
            ack_after_ms,
        } => listen(&addr, ack, Duration::from_millis(ack_after_ms)).await?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_axis_range_parse() {
        let range: AxisRange = "-1000:1000:21".parse().unwrap();
        assert_eq!(range.start, -1000.0);
        assert_eq!(range.stop, 1000.0);
        assert_eq!(range.points, 21);

        assert!("1:2".parse::<AxisRange>().is_err());
        assert!("a:2:3".parse::<AxisRange>().is_err());
    }

    #[test]
    fn test_cli_parses() {
        let args = Args::try_parse_from([
            "mbctl", "start", "--x", "-10:10:3", "--y", "0:0:1", "--hits", "5", "--units", "um",
        ])
        .unwrap();
        match args.command {
            Command::Start { x, hits, units, .. } => {
                assert_eq!(x.points, 3);
                assert_eq!(hits, 5);
                assert_eq!(units, ScanUnit::Micrometer);
            }
            other => panic!("Expected Start, got {other:?}"),
        }
    }
}
