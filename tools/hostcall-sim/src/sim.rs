//! Simulated device grid
//!
//! Every simulated thread issues `FunctionCall`s whose replies it can
//! predict, plus an occasional printf, and checks each reply against the
//! value it computed locally. A reply meant for another thread shows up as
//! a mismatch.

use std::io;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use colored::Colorize;
use kaal_hostcall::{
    Caller, Dispatcher, DispatcherStats, HostcallError, ServiceId, ServiceRegistry, SlotTable,
    TableStats,
};
use kaal_hostcall_services::{
    device_printf, register_builtins, FunctionCallError, FunctionTable, PrintfArg, PrintfService,
    PrintfWriter, SharedBuffer,
};

use crate::config::SimConfig;

/// Host function: `[a0 * a1 + a2, a0 ^ a1]`, wrapping
pub const FN_MIX: u64 = 0x0000_7f00_0000_1000;
/// Host function: echoes its first two words
pub const FN_ECHO: u64 = 0x0000_7f00_0000_2000;

fn mix(a: &[u64; 7]) -> [u64; 2] {
    [a[0].wrapping_mul(a[1]).wrapping_add(a[2]), a[0] ^ a[1]]
}

pub fn function_table() -> Result<FunctionTable, FunctionCallError> {
    let mut functions = FunctionTable::new();
    functions.register(FN_MIX, mix)?;
    functions.register(FN_ECHO, |a| [a[0], a[1]])?;
    Ok(functions)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThreadTally {
    pub ok: u64,
    pub mismatched: u64,
    pub exhausted: u64,
    pub failed: u64,
    pub printed: u64,
    pub printf_bytes: u64,
}

impl ThreadTally {
    fn merge(&mut self, other: ThreadTally) {
        self.ok += other.ok;
        self.mismatched += other.mismatched;
        self.exhausted += other.exhausted;
        self.failed += other.failed;
        self.printed += other.printed;
        self.printf_bytes += other.printf_bytes;
    }

    fn record_error(&mut self, thread_id: usize, err: HostcallError) {
        match err {
            HostcallError::TableExhausted { .. } => self.exhausted += 1,
            other => {
                log::warn!("thread {}: {}", thread_id, other);
                self.failed += 1;
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct SimReport {
    pub calls: u64,
    pub tally: ThreadTally,
    pub elapsed: Duration,
    pub dispatcher: DispatcherStats,
    pub table: TableStats,
}

impl SimReport {
    pub fn passed(&self) -> bool {
        self.tally.mismatched == 0 && self.tally.failed == 0
    }

    pub fn print(&self) {
        let secs = self.elapsed.as_secs_f64().max(f64::EPSILON);
        println!();
        println!("{}", "Hostcall simulation".bold());
        println!("  calls:        {}", self.calls);
        println!("  ok:           {}", self.tally.ok.to_string().green());
        let mismatched = self.tally.mismatched.to_string();
        println!(
            "  mismatched:   {}",
            if self.tally.mismatched == 0 { mismatched.green() } else { mismatched.red() }
        );
        let failed = self.tally.failed.to_string();
        println!(
            "  failed:       {}",
            if self.tally.failed == 0 { failed.green() } else { failed.red() }
        );
        println!("  exhausted:    {}", self.tally.exhausted.to_string().yellow());
        println!("  printf:       {} messages, {} bytes", self.tally.printed, self.tally.printf_bytes);
        println!("  elapsed:      {:.3}s ({:.0} calls/s)", secs, self.calls as f64 / secs);
        println!(
            "  dispatcher:   {} dispatched, {} unknown, {} failed, {} panicked",
            self.dispatcher.dispatched,
            self.dispatcher.unknown,
            self.dispatcher.failed,
            self.dispatcher.panicked
        );
        println!(
            "  slot table:   {} acquired, {} exhausted, {} abandoned",
            self.table.acquired, self.table.exhausted, self.table.abandoned
        );
        println!();
        if self.passed() {
            println!("{} every reply reached its caller", "✅".green());
        } else {
            println!("{} replies were lost or misdelivered", "❌".red());
        }
    }
}

fn device_thread(caller: &Caller, config: &SimConfig, thread_id: usize) -> ThreadTally {
    let mut tally = ThreadTally::default();
    let tid = thread_id as u64;

    for call in 0..config.calls {
        let n = call as u64;
        if config.printf_every != 0 && call % config.printf_every == 0 {
            let args = [PrintfArg::from(tid), PrintfArg::from(n), PrintfArg::Str("sim")];
            let expected = format!("[{}] thread {} call {}\n", "sim", tid, n).len() as u64;
            match device_printf(caller, "[%s] thread %d call %d\n", &args) {
                Ok(written) if written == expected => {
                    tally.printed += 1;
                    tally.printf_bytes += written;
                }
                Ok(written) => {
                    log::error!("thread {}: printf wrote {} bytes, expected {}", tid, written, expected);
                    tally.mismatched += 1;
                }
                Err(err) => tally.record_error(thread_id, err),
            }
            continue;
        }

        let args = [(tid << 32) | n, n.wrapping_mul(0x9E37_79B9), tid, 0, 0, 0, 0];
        let (function, expected) = if call % 2 == 0 {
            (FN_MIX, mix(&args))
        } else {
            (FN_ECHO, [args[0], args[1]])
        };

        let mut packet = [0u64; 8];
        packet[0] = function;
        packet[1..].copy_from_slice(&args);

        match caller.call(ServiceId::FunctionCall, packet) {
            Ok(reply) if reply == expected => tally.ok += 1,
            Ok(reply) => {
                log::error!(
                    "thread {} call {}: got {:x?}, expected {:x?}",
                    tid,
                    n,
                    reply,
                    expected
                );
                tally.mismatched += 1;
            }
            Err(err) => tally.record_error(thread_id, err),
        }
    }
    tally
}

pub fn run(config: &SimConfig) -> anyhow::Result<SimReport> {
    config.validate()?;

    let writer = if config.printf_to_stdout {
        PrintfWriter::spawn(io::stdout())?
    } else {
        PrintfWriter::spawn(SharedBuffer::new())?
    };
    let printf = Arc::new(PrintfService::new(writer));

    let mut registry = ServiceRegistry::new();
    register_builtins(&mut registry, function_table()?, printf.clone())?;

    let table = Arc::new(SlotTable::new(config.hostcall.capacity)?);
    let running = Dispatcher::new(table.clone(), registry).spawn(&config.hostcall)?;
    let caller = Caller::new(table.clone(), config.hostcall.backpressure);

    log::info!(
        "running {} threads x {} calls against {} slots",
        config.threads,
        config.calls,
        config.hostcall.capacity
    );

    let started = Instant::now();
    let tally = thread::scope(|s| {
        let workers: Vec<_> = (0..config.threads)
            .map(|thread_id| {
                let caller = &caller;
                s.spawn(move || device_thread(caller, config, thread_id))
            })
            .collect();

        let mut total = ThreadTally::default();
        for worker in workers {
            match worker.join() {
                Ok(tally) => total.merge(tally),
                Err(_) => {
                    log::error!("device thread panicked");
                    total.failed += 1;
                }
            }
        }
        total
    });
    let elapsed = started.elapsed();

    let dispatcher = running.shutdown();
    printf.writer().flush()?;

    Ok(SimReport {
        calls: (config.threads * config.calls) as u64,
        tally,
        elapsed,
        dispatcher,
        table: table.stats(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use kaal_hostcall::Backpressure;

    #[test]
    fn test_small_grid_has_no_mismatches() {
        let mut config = SimConfig {
            threads: 4,
            calls: 50,
            printf_every: 10,
            ..SimConfig::default()
        };
        config.hostcall.capacity = 2;
        config.hostcall.workers = 2;
        config.hostcall.backpressure = Backpressure::Unbounded;

        let report = run(&config).unwrap();
        assert!(report.passed(), "{:?}", report);
        assert_eq!(report.tally.ok + report.tally.printed, 200);
        assert_eq!(report.tally.printed, 20);
        assert_eq!(report.table.abandoned, 0);
    }

    #[test]
    fn test_function_table_contents() {
        let functions = function_table().unwrap();
        assert_eq!(functions.invoke(FN_MIX, &[3, 4, 5, 0, 0, 0, 0]), Ok([17, 7]));
        assert_eq!(functions.invoke(FN_ECHO, &[8, 9, 0, 0, 0, 0, 0]), Ok([8, 9]));
    }
}
