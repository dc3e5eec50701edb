#![no_main]

use libfuzzer_sys::fuzz_target;
use scrutinize::output::LogReader;
use std::io::Write;

fuzz_target!(|data: &[u8]| {
    // Arbitrary bytes on disk, as left by a crashed or corrupted producer
    let mut file = match tempfile::NamedTempFile::new() {
        Ok(file) => file,
        Err(_) => return,
    };
    if file.write_all(data).is_err() {
        return;
    }

    // Reading must never panic: damaged input is truncation or an error
    if let Ok(mut reader) = LogReader::open(file.path()) {
        let _ = reader.events();
    }
});
