#![no_main]

use arbitrary::Arbitrary;
use bytes::Bytes;
use hybi_driver::{
    extensions::permessage_deflate, CloseEvent, Config, Data, Driver, ExtensionConfiguration,
    Handler, ProtocolError, ReadyState, UpgradeRequest,
};
use libfuzzer_sys::fuzz_target;

#[derive(Arbitrary, Debug)]
enum Operation {
    /// Feed a chunk of bytes into the parser.
    Parse(Vec<u8>),
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Close(String),
    ForceClose,
}

#[derive(Arbitrary, Debug)]
struct Workload {
    /// Offer permessage-deflate in the handshake.
    deflate: bool,
    require_masking: bool,
    /// Limit to a small int to avoid OOM.
    max_length: u16,
    /// Operations performed before the handshake completes.
    before_start: Vec<Operation>,
    operations: Vec<Operation>,
}

#[derive(Default)]
struct Counter {
    closes: usize,
    errors: usize,
}

impl Handler for Counter {
    fn write(&mut self, _bytes: Bytes) {}

    fn on_message(&mut self, data: Data) {
        if let Data::Text(text) = data {
            assert!(std::str::from_utf8(text.as_bytes()).is_ok());
        }
    }

    fn on_error(&mut self, _error: &ProtocolError) {
        self.errors += 1;
    }

    fn on_close(&mut self, _event: CloseEvent) {
        self.closes += 1;
    }
}

fn apply(driver: &mut Driver<Counter>, operation: Operation) {
    let _ = match operation {
        Operation::Parse(chunk) => {
            driver.parse(&chunk);
            Ok(())
        }
        Operation::Text(text) => driver.text(text),
        Operation::Binary(data) => driver.binary(data),
        Operation::Ping(payload) => driver.ping(payload),
        Operation::Close(reason) => driver.close(&reason, None),
        Operation::ForceClose => {
            driver.force_close();
            Ok(())
        }
    };
}

fn fuzz(workload: Workload) {
    let mut request = UpgradeRequest::new("dGhlIHNhbXBsZSBub25jZQ==");
    let mut config = Config::default()
        .require_masking(workload.require_masking)
        .max_length(Some(workload.max_length.into()));

    if workload.deflate {
        request = request.extensions("permessage-deflate; client_max_window_bits");
        config = config.extensions(
            ExtensionConfiguration::default()
                .permessage_deflate(permessage_deflate::Configuration::default()),
        );
    }

    let mut driver = Driver::new(&request, config, Counter::default());

    for operation in workload.before_start {
        apply(&mut driver, operation);
    }
    let _ = driver.start();
    for operation in workload.operations {
        apply(&mut driver, operation);
    }

    let handler = driver.handler();
    assert!(handler.closes <= 1);
    assert!(handler.errors <= handler.closes);
    if driver.ready_state() == ReadyState::Closed {
        assert_eq!(handler.closes, 1);
    }
}

fuzz_target!(|workload: Workload| {
    fuzz(workload);
});
