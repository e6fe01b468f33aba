#![no_main]

use libfuzzer_sys::fuzz_target;
use rohc_engine::{CidType, Compressor, Decompressor, Mode, ProfileId};

const PROFILES: &[ProfileId] = &[
    ProfileId::Rtp,
    ProfileId::Udp,
    ProfileId::UdpLite,
    ProfileId::Esp,
    ProfileId::Ip,
    ProfileId::Tcp,
];

fuzz_target!(|data: &[u8]| {
    // The decompressor must never panic, whatever arrives on the
    // channel; errors are the expected outcome for garbage.
    let mut decompressor = Decompressor::new(15, CidType::Small, PROFILES);
    decompressor.set_mrru(2000);
    decompressor.set_target_mode(Mode::Optimistic);
    for chunk in data.chunks(97) {
        let _ = decompressor.decompress(chunk);
        let _ = decompressor.poll_feedback();
    }

    let mut large = Decompressor::new(1023, CidType::Large, PROFILES);
    let _ = large.decompress(data);

    // Arbitrary bytes are also legal compressor input: anything
    // unparseable must fall back to the Uncompressed profile, not panic.
    let mut compressor = Compressor::new(15, CidType::Small, PROFILES);
    let _ = compressor.compress(data);
    let _ = compressor.deliver_feedback(data);
});
