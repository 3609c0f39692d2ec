#![no_main]

use libfuzzer_sys::fuzz_target;

use contun::socks;

fuzz_target!(|data: &[u8]| {
    let _ = socks::parse_greeting(data);
    let _ = socks::parse_request(data);
});
