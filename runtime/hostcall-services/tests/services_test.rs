//! Built-in services driven through a live dispatcher

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use kaal_hostcall::{
    Backpressure, CallPacket, Caller, Dispatcher, DispatcherHandle, HostcallConfig,
    HostcallError, ReplyPacket, ServiceError, ServiceHandler, ServiceId, ServiceRegistry,
    SlotTable,
};
use kaal_hostcall_services::{
    device_printf, register_builtins, FunctionTable, PrintfArg, PrintfLimits, PrintfService,
    PrintfWriter, SharedBuffer,
};

const FN_MADD: u64 = 0x5555_0000_1000;
const FN_MINUS_ONE: u64 = 0x5555_0000_2000;
const FN_BAADF00D: u64 = 0x5555_0000_3000;

struct Harness {
    caller: Caller,
    printf: Arc<PrintfService>,
    sink: SharedBuffer,
    _running: DispatcherHandle,
}

fn harness(capacity: usize) -> Harness {
    let _ = env_logger::builder().is_test(true).try_init();

    let mut functions = FunctionTable::new();
    functions
        .register(FN_MADD, |a| [a[0] * a[1] + a[2], 0])
        .unwrap();
    functions.register(FN_MINUS_ONE, |_| [u64::MAX, 0]).unwrap();
    functions
        .register(FN_BAADF00D, |_| [0xBAAD_F00D_BAAD_F00D; 2])
        .unwrap();

    let sink = SharedBuffer::new();
    let printf = Arc::new(PrintfService::new(PrintfWriter::spawn(sink.clone()).unwrap()));

    let mut registry = ServiceRegistry::new();
    register_builtins(&mut registry, functions, printf.clone()).unwrap();

    let table = Arc::new(SlotTable::new(capacity).unwrap());
    let running = Dispatcher::new(table.clone(), registry)
        .spawn(&HostcallConfig::default())
        .unwrap();

    Harness {
        caller: Caller::new(table, Backpressure::Unbounded),
        printf,
        sink,
        _running: running,
    }
}

#[test]
fn test_function_call_through_dispatcher() {
    let h = harness(8);
    assert_eq!(
        h.caller
            .call(ServiceId::FunctionCall, [FN_MADD, 6, 7, 100, 0, 0, 0, 0]),
        Ok([142, 0])
    );
    assert_eq!(
        h.caller.call(ServiceId::FunctionCall, [0x1, 0, 0, 0, 0, 0, 0, 0]),
        Err(HostcallError::HandlerFailure {
            service: ServiceId::FunctionCall,
            code: 1
        })
    );
}

#[test]
fn test_printf_multi_chunk_message() {
    let h = harness(8);
    let name = "a string argument long enough to need two chunks of fifty-six bytes";
    let args = [
        PrintfArg::from(-7i64),
        PrintfArg::from(255u64),
        PrintfArg::from(2.5f64),
        PrintfArg::from('x'),
        PrintfArg::from(name),
        PrintfArg::from(1u64),
        PrintfArg::from(2u64),
        PrintfArg::from(3u64),
        PrintfArg::from(4u64),
        PrintfArg::from("tail"),
    ];
    let fmt = "d=%d x=%#x f=%.2f c=%c s=[%s] %d%d%d%d %s\n";
    let expected = format!(
        "d=-7 x=0xff f=2.50 c=x s=[{}] 1234 tail\n",
        name
    );

    let written = device_printf(&h.caller, fmt, &args).unwrap();
    assert_eq!(written, expected.len() as u64);

    h.printf.writer().flush().unwrap();
    assert_eq!(h.sink.contents(), expected);
    assert_eq!(h.printf.open_messages(), 0);
}

#[test]
fn test_printf_long_format_string() {
    let h = harness(4);
    let fmt = format!("{}%s{}\n", "<".repeat(60), ">".repeat(60));
    device_printf(&h.caller, &fmt, &[PrintfArg::Str("mid")]).unwrap();

    h.printf.writer().flush().unwrap();
    assert_eq!(
        h.sink.contents(),
        format!("{}mid{}\n", "<".repeat(60), ">".repeat(60))
    );
}

#[test]
fn test_concurrent_printf_messages_do_not_mix() {
    let h = harness(32);
    thread::scope(|s| {
        for t in 0..8u64 {
            let caller = &h.caller;
            s.spawn(move || {
                for i in 0..10u64 {
                    device_printf(caller, "thread %d line %d\n", &[t.into(), i.into()]).unwrap();
                }
            });
        }
    });

    h.printf.writer().flush().unwrap();
    let contents = h.sink.contents();
    let lines: Vec<_> = contents.lines().collect();
    assert_eq!(lines.len(), 80);
    for t in 0..8 {
        for i in 0..10 {
            let line = format!("thread {} line {}", t, i);
            assert!(lines.contains(&line.as_str()), "missing {:?}", line);
        }
    }
}

#[test]
fn test_printf_format_error_reported() {
    let h = harness(4);
    let result = device_printf(&h.caller, "%d %d\n", &[PrintfArg::Word(1)]);
    assert_eq!(
        result,
        Err(HostcallError::HandlerFailure {
            service: ServiceId::Printf,
            code: 3
        })
    );
    assert_eq!(h.printf.open_messages(), 0);
}

#[test]
fn test_function_results_shaped_like_sentinels_are_returned() {
    let h = harness(4);
    assert_eq!(
        h.caller.call(ServiceId::FunctionCall, [FN_MINUS_ONE, 0, 0, 0, 0, 0, 0, 0]),
        Ok([u64::MAX, 0])
    );
    assert_eq!(
        h.caller.call(ServiceId::FunctionCall, [FN_BAADF00D, 0, 0, 0, 0, 0, 0, 0]),
        Ok([0xBAAD_F00D_BAAD_F00D; 2])
    );
}

/// Printf service that fails one packet, to break a message mid-stream
struct FailingNth {
    inner: Arc<PrintfService>,
    seen: AtomicUsize,
    fail_at: usize,
}

impl ServiceHandler for FailingNth {
    fn handle(&self, packet: &CallPacket) -> Result<ReplyPacket, ServiceError> {
        if self.seen.fetch_add(1, Ordering::Relaxed) == self.fail_at {
            return Err(ServiceError::new(0x77));
        }
        self.inner.handle(packet)
    }
}

fn printf_harness(printf: Arc<PrintfService>, fail_at: usize) -> (Caller, DispatcherHandle) {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut registry = ServiceRegistry::new();
    registry
        .register(
            ServiceId::Printf,
            FailingNth {
                inner: printf,
                seen: AtomicUsize::new(0),
                fail_at,
            },
        )
        .unwrap();
    let table = Arc::new(SlotTable::new(4).unwrap());
    let running = Dispatcher::new(table.clone(), registry)
        .spawn(&HostcallConfig::default())
        .unwrap();
    (Caller::new(table, Backpressure::Unbounded), running)
}

#[test]
fn test_failed_printf_stream_is_discarded() {
    let sink = SharedBuffer::new();
    let printf = Arc::new(PrintfService::new(PrintfWriter::spawn(sink.clone()).unwrap()));
    // Packet 0 is Begin, packet 1 the format string, packet 2 the arguments
    let (caller, _running) = printf_harness(printf.clone(), 2);

    let result = device_printf(&caller, "%d %d %s\n", &[1u64.into(), 2u64.into(), "x".into()]);
    assert_eq!(
        result,
        Err(HostcallError::HandlerFailure {
            service: ServiceId::Printf,
            code: 0x77
        })
    );
    assert_eq!(printf.open_messages(), 0);

    // The next message is unaffected
    assert_eq!(device_printf(&caller, "ok\n", &[]), Ok(3));
    printf.writer().flush().unwrap();
    assert_eq!(sink.contents(), "ok\n");
}

#[test]
fn test_oversized_printf_rejected() {
    let sink = SharedBuffer::new();
    let limits = PrintfLimits {
        max_message_bytes: 64,
        ..PrintfLimits::default()
    };
    let printf = Arc::new(PrintfService::with_limits(
        PrintfWriter::spawn(sink.clone()).unwrap(),
        limits,
    ));
    let (caller, _running) = printf_harness(printf.clone(), usize::MAX);

    let long = "y".repeat(200);
    assert_eq!(
        device_printf(&caller, "%s\n", &[PrintfArg::Str(&long)]),
        Err(HostcallError::HandlerFailure {
            service: ServiceId::Printf,
            code: 5
        })
    );
    assert_eq!(printf.open_messages(), 0);
    printf.writer().flush().unwrap();
    assert_eq!(sink.contents(), "");
}
