//! Terminal presenter: reflects the session state and forwards typed commands.
//!
//! Reads one command per line, sends it over the bus and prints the answer.
//! Also polls the state on a fixed interval and prints it when it changed, and
//! prints coordinator events as they happen.

use std::io::{BufRead, Write};
use std::str::FromStr;
use std::time::Duration;

use anyhow::Result;
use rust_decimal::Decimal;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, MissedTickBehavior};
use tracing::debug;

use crate::bus::BusClient;
use crate::coordinator::CoordinatorEvent;
use crate::models::{SessionState, TradeHistoryEntry, TradeSide};
use crate::protocol::{Request, Response};

/// How often the presenter refreshes the state.
pub const STATE_POLL_INTERVAL: Duration = Duration::from_millis(2000);

pub const HELP: &str = "\
Commands:
  auto <amount>                  start auto-trade round trips
  stop-auto                      stop auto-trade
  batch <BUY|SELL> <amount> <n>  open n orders in one direction
  stop-batch                     stop the batch
  stop                           stop everything
  state                          show session state
  history [n]                    show the last n trades
  clear-history                  delete trade history
  price                          read the current price from the page
  ping                           check the trading page answers
  quit                           leave (cycles keep their state)";

/// A parsed input line.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Send(Request),
    Help,
    Quit,
}

/// Parse one input line. `symbol` fills in price requests.
pub fn parse_command(line: &str, symbol: &str) -> Result<Command, String> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Err("empty command".to_string());
    };
    let args: Vec<&str> = words.collect();

    let command = match (verb.to_ascii_lowercase().as_str(), args.as_slice()) {
        ("auto", [amount]) => Request::StartAutoTrade {
            amount: parse_decimal(amount)?,
        },
        ("stop-auto", []) => Request::StopAutoTrade,
        ("batch", [direction, amount, count]) => Request::StartBatchOpen {
            direction: TradeSide::from_str(direction)?,
            amount: parse_decimal(amount)?,
            count: count
                .parse()
                .map_err(|_| format!("invalid order count: {}", count))?,
        },
        ("stop-batch", []) => Request::StopBatchOpen,
        ("stop", []) => Request::StopAllTrading,
        ("state", []) => Request::GetTradingState,
        ("history", []) => Request::GetTradeHistory { limit: None },
        ("history", [limit]) => Request::GetTradeHistory {
            limit: Some(limit.parse().map_err(|_| format!("invalid limit: {}", limit))?),
        },
        ("clear-history", []) => Request::ClearTradeHistory,
        ("price", []) => Request::GetCurrentPrice {
            symbol: symbol.to_string(),
        },
        ("ping", []) => Request::Ping,
        ("help", _) => return Ok(Command::Help),
        ("quit" | "exit", []) => return Ok(Command::Quit),
        _ => return Err(format!("unknown command: {} (type help)", line.trim())),
    };

    Ok(Command::Send(command))
}

fn parse_decimal(text: &str) -> Result<Decimal, String> {
    Decimal::from_str(text).map_err(|_| format!("invalid amount: {}", text))
}

/// Multi-line summary of the session.
pub fn render_state(state: &SessionState) -> String {
    let auto = if state.auto_trading {
        format!("running, amount {}", state.auto_amount)
    } else {
        "stopped".to_string()
    };
    let batch = if state.batch_opening {
        format!(
            "{} {}/{}, amount {}",
            state.batch_direction, state.batch_completed, state.batch_total, state.batch_amount
        )
    } else if state.batch_total > 0 {
        format!("idle (last batch {}/{})", state.batch_completed, state.batch_total)
    } else {
        "idle".to_string()
    };
    let page = state
        .last_active_surface_id
        .as_ref()
        .map(|id| id.to_string())
        .unwrap_or_else(|| "none yet".to_string());

    format!(
        "Auto-trade: {}\nBatch:      {}\nTrades:     {}\nPage:       {}",
        auto, batch, state.trade_count, page
    )
}

fn render_history(history: &[TradeHistoryEntry]) -> String {
    if history.is_empty() {
        return "No trades logged".to_string();
    }
    history
        .iter()
        .map(|entry| {
            let payload = serde_json::to_string(&entry.payload).unwrap_or_default();
            format!("{}  {}  {}", entry.timestamp, entry.id, payload)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn render_response(response: &Response) -> String {
    if !response.success {
        return format!("Error: {}", response.summary());
    }
    if let Some(state) = &response.state {
        return render_state(state);
    }
    if let Some(history) = &response.history {
        return render_history(history);
    }
    if let (Some(price), Some(symbol)) = (&response.price, &response.symbol) {
        return format!("{}: {}", symbol, price);
    }
    response.summary()
}

/// Terminal front end bound to a bus client.
pub struct Presenter<W: Write> {
    bus: BusClient,
    events: broadcast::Receiver<CoordinatorEvent>,
    symbol: String,
    out: W,
    last_state: Option<SessionState>,
}

impl<W: Write + Send> Presenter<W> {
    pub fn new(
        bus: BusClient,
        events: broadcast::Receiver<CoordinatorEvent>,
        symbol: impl Into<String>,
        out: W,
    ) -> Self {
        Self {
            bus,
            events,
            symbol: symbol.into(),
            out,
            last_state: None,
        }
    }

    /// Run until `quit` or end of input. Returns the output sink.
    pub async fn run(mut self, mut input: mpsc::Receiver<String>) -> Result<W> {
        let mut poll = interval(STATE_POLL_INTERVAL);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        writeln!(self.out, "Type help for commands")?;

        loop {
            tokio::select! {
                biased;
                _ = poll.tick() => self.refresh().await?,
                line = input.recv() => {
                    let Some(line) = line else {
                        debug!("Input closed");
                        break;
                    };
                    if line.trim().is_empty() {
                        continue;
                    }
                    match parse_command(&line, &self.symbol) {
                        Ok(Command::Quit) => break,
                        Ok(Command::Help) => writeln!(self.out, "{}", HELP)?,
                        Ok(Command::Send(request)) => self.send(request).await?,
                        Err(e) => writeln!(self.out, "{}", e)?,
                    }
                }
                Ok(event) = self.events.recv() => writeln!(self.out, "» {}", event)?,
            }
            self.out.flush()?;
        }

        Ok(self.out)
    }

    async fn send(&mut self, request: Request) -> Result<()> {
        let is_state_query = matches!(request, Request::GetTradingState);
        let response = self.bus.send(request).await?;

        if is_state_query {
            self.last_state = response.state.clone();
        }
        writeln!(self.out, "{}", render_response(&response))?;
        Ok(())
    }

    /// Print the state when it differs from the last one shown.
    async fn refresh(&mut self) -> Result<()> {
        let response = self.bus.send(Request::GetTradingState).await?;
        let Some(state) = response.state else {
            return Ok(());
        };
        if self.last_state.as_ref() != Some(&state) {
            writeln!(self.out, "{}", render_state(&state))?;
            self.last_state = Some(state);
        }
        Ok(())
    }
}

/// Forward stdin lines into a channel from a plain thread, so a pending read
/// never holds up runtime shutdown.
pub fn spawn_stdin_reader() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(16);
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if tx.blocking_send(line).is_err() {
                break;
            }
        }
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::surface::SurfaceId;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parses_trading_commands() {
        assert_eq!(
            parse_command("auto 20", "BTCUSDT"),
            Ok(Command::Send(Request::StartAutoTrade { amount: dec!(20) }))
        );
        assert_eq!(
            parse_command("batch sell 15.5 3", "BTCUSDT"),
            Ok(Command::Send(Request::StartBatchOpen {
                direction: TradeSide::Sell,
                amount: dec!(15.5),
                count: 3,
            }))
        );
        assert_eq!(
            parse_command("history 5", "BTCUSDT"),
            Ok(Command::Send(Request::GetTradeHistory { limit: Some(5) }))
        );
        assert_eq!(
            parse_command("price", "ETHUSDT"),
            Ok(Command::Send(Request::GetCurrentPrice {
                symbol: "ETHUSDT".to_string()
            }))
        );
        assert_eq!(parse_command("QUIT", "BTCUSDT"), Ok(Command::Quit));
    }

    #[test]
    fn test_rejects_malformed_commands() {
        assert!(parse_command("auto", "BTCUSDT").is_err());
        assert!(parse_command("auto twenty", "BTCUSDT").is_err());
        assert!(parse_command("batch UP 20 3", "BTCUSDT").is_err());
        assert!(parse_command("batch BUY 20 -1", "BTCUSDT").is_err());
        assert!(parse_command("launch", "BTCUSDT").unwrap_err().contains("unknown command"));
    }

    #[test]
    fn test_render_state() {
        let state = SessionState {
            auto_trading: true,
            auto_amount: dec!(20),
            batch_opening: true,
            batch_direction: TradeSide::Sell,
            batch_amount: dec!(10),
            batch_total: 3,
            batch_completed: 1,
            trade_count: 7,
            last_active_surface_id: Some(SurfaceId::new("tab-1")),
        };
        let text = render_state(&state);

        assert!(text.contains("Auto-trade: running, amount 20"));
        assert!(text.contains("Batch:      SELL 1/3, amount 10"));
        assert!(text.contains("Trades:     7"));
        assert!(text.contains("tab-1"));
    }

    #[test]
    fn test_render_failure() {
        let text = render_response(&Response::failure("No trading page found"));
        assert_eq!(text, "Error: No trading page found");
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_renders_answers_and_quits() {
        let (bus, mut requests) = crate::bus::channel(8);
        tokio::spawn(async move {
            while let Some(envelope) = requests.recv().await {
                let response = match envelope.request {
                    Request::GetTradingState => Response::ok().with_state(SessionState::default()),
                    Request::Ping => Response::ok().with_message("pong"),
                    _ => Response::failure("unsupported"),
                };
                let _ = envelope.reply.send(response);
            }
        });
        let (_events_tx, events) = broadcast::channel(4);
        let (input_tx, input) = mpsc::channel(8);
        for line in ["ping", "stop", "nonsense", "quit"] {
            input_tx.send(line.to_string()).await.unwrap();
        }

        let presenter = Presenter::new(bus, events, "BTCUSDT", Vec::new());
        let out = presenter.run(input).await.unwrap();
        let out = String::from_utf8(out).unwrap();

        assert!(out.contains("Auto-trade: stopped"));
        assert!(out.contains("pong"));
        assert!(out.contains("Error: unsupported"));
        assert!(out.contains("unknown command: nonsense"));
    }
}
