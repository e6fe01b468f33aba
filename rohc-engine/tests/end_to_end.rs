//! End-to-end scenarios driving a compressor and a decompressor over an
//! in-memory channel

mod common;

use common::{Lcg, ip_packet, ipv6_header, rtp_packet, udp_header};
use rohc_engine::{
    CidType, Compressor, DecompressStatus, Decompressor, Mode, ProfileId, RohcError,
};

const RTP_PROFILES: &[ProfileId] = &[ProfileId::Rtp, ProfileId::Udp, ProfileId::Ip];

#[test]
fn rtp_stream_lossless_u_mode() {
    let mut compressor = Compressor::new(15, CidType::Small, RTP_PROFILES);
    let mut decompressor = Decompressor::new(15, CidType::Small, RTP_PROFILES);

    let payload = [0x11u8; 20];
    let mut one_octet_headers = 0;
    for sn in 0u16..1000 {
        let packet = rtp_packet(
            0x2000 + sn,
            sn,
            160 * u32::from(sn),
            0xdead_beef,
            false,
            &payload,
        );
        let compressed = compressor.compress(&packet).unwrap();
        assert_eq!(compressed.profile, ProfileId::Rtp);
        assert_eq!(compressed.cid, 0);
        if sn == 0 {
            // The first packet carries full static and dynamic chains
            assert!(compressed.packet.len() >= 30, "IR should be large");
        }
        if compressed.packet.len() == 1 + payload.len() {
            one_octet_headers += 1;
        }

        let outcome = decompressor.decompress(compressed.packet).unwrap();
        assert_eq!(outcome.status, DecompressStatus::Packet);
        assert_eq!(outcome.packet.unwrap(), &packet[..], "packet {sn}");
    }

    // Steady state is the one-octet UO-0
    assert!(
        one_octet_headers > 900,
        "only {one_octet_headers} UO-0 packets"
    );
}

#[test]
fn ip_only_with_loss_o_mode_recovers() {
    let mut compressor = Compressor::new(15, CidType::Small, &[ProfileId::Ip]);
    let mut decompressor = Decompressor::new(15, CidType::Small, &[ProfileId::Ip]);
    decompressor.set_target_mode(Mode::Optimistic);

    let mut lcg = Lcg(0x5eed);
    let mut delivered = 0u32;
    let mut decoded = 0u32;
    let mut nacks = 0u32;
    let mut tail_failures = 0u32;
    let total = 10_000u16;

    for step in 0..total {
        let packet = ip_packet(0x0100u16.wrapping_add(step), &[step as u8; 8]);
        let compressed = compressor.compress(&packet).unwrap();

        // 5% uniform loss, plus one long burst to outrun the W-LSB
        // interpretation interval
        let lost = lcg.chance(5) || (5000..5040).contains(&step);
        if lost {
            continue;
        }
        delivered += 1;

        match decompressor.decompress(compressed.packet) {
            Ok(outcome) => {
                assert_eq!(outcome.packet.unwrap(), &packet[..]);
                decoded += 1;
                if let Some(feedback) = outcome.feedback {
                    compressor.deliver_feedback(&feedback).unwrap();
                }
            }
            Err(_) => {
                if step > total - 100 {
                    tail_failures += 1;
                }
                if let Some(feedback) = decompressor.poll_feedback() {
                    nacks += 1;
                    compressor.deliver_feedback(&feedback).unwrap();
                }
            }
        }
    }

    assert!(nacks >= 1, "the loss burst should have produced a NACK");
    // No permanent divergence: the tail decodes cleanly
    assert_eq!(tail_failures, 0);
    assert!(
        decoded * 100 >= delivered * 98,
        "decoded {decoded} of {delivered}"
    );
}

#[test]
fn ssrc_change_refreshes_context_in_place() {
    let mut compressor = Compressor::new(15, CidType::Small, RTP_PROFILES);
    let mut decompressor = Decompressor::new(15, CidType::Small, RTP_PROFILES);

    let mut saw_fresh_ir = false;
    for sn in 0u16..1000 {
        let ssrc = if sn < 500 { 0xdead_beef } else { 0x0bad_cafe };
        let packet = rtp_packet(sn, sn, 160 * u32::from(sn), ssrc, false, b"voice");
        let compressed = compressor.compress(&packet).unwrap();
        assert_eq!(compressed.cid, 0, "same CID across the SSRC change");
        if sn == 500 {
            // Static chain changed: back to IR
            assert_eq!(compressed.packet[0] & 0b1111_1110, 0b1111_1100);
            saw_fresh_ir = true;
        }
        if sn == 999 {
            // Compression has recovered after the change
            assert!(compressed.packet.len() < packet.len() / 4);
        }
        let outcome = decompressor.decompress(compressed.packet).unwrap();
        assert_eq!(outcome.packet.unwrap(), &packet[..], "packet {sn}");
    }
    assert!(saw_fresh_ir);
}

#[test]
fn rtp_small_field_deltas_use_small_formats() {
    let mut compressor = Compressor::new(15, CidType::Small, RTP_PROFILES);
    let mut decompressor = Decompressor::new(15, CidType::Small, RTP_PROFILES);

    let mut saw_uo1_family = false;
    let mut saw_ext = [false; 3];
    let mut offset = 0u16;
    let mut ts_extra = 0u32;
    for sn in 0u16..400 {
        // Perturb the IP-ID offset and the TS-vs-stride delta by small
        // amounts so every format between UO-0 and EXT-3 gets its turn
        match sn {
            60..=70 => offset += 1,
            90..=100 => ts_extra += 1,
            120 => ts_extra += 40,
            150..=160 => {
                offset += 1;
                ts_extra += 1;
            }
            200 => ts_extra += 600,
            240 => offset += 300,
            _ => {}
        }
        let packet = rtp_packet(
            0x3000u16.wrapping_add(sn).wrapping_add(offset),
            sn,
            160 * (u32::from(sn) + ts_extra),
            0x0abc_def0,
            false,
            b"delta",
        );
        let compressed = compressor.compress(&packet).unwrap();
        let bytes = compressed.packet;
        if bytes[0] & 0xc0 == 0x80 {
            saw_uo1_family = true;
        }
        if bytes[0] & 0xe0 == 0xc0 && bytes.len() > 3 && bytes[2] & 0x80 != 0 {
            let kind = bytes[3] >> 6;
            if usize::from(kind) < saw_ext.len() {
                saw_ext[usize::from(kind)] = true;
            }
        }

        let outcome = decompressor.decompress(bytes).unwrap();
        assert_eq!(outcome.packet.unwrap(), &packet[..], "packet {sn}");
    }

    assert!(saw_uo1_family, "UO-1 family never chosen");
    assert!(saw_ext[0], "EXT-0 never chosen");
    assert!(saw_ext[1], "EXT-1 never chosen");
    assert!(saw_ext[2], "EXT-2 never chosen");
}

#[test]
fn two_flows_multiplex_on_small_cids() {
    let profiles = &[ProfileId::Udp, ProfileId::Ip];
    let mut compressor = Compressor::new(15, CidType::Small, profiles);
    let mut decompressor = Decompressor::new(15, CidType::Small, profiles);

    for step in 0u16..50 {
        for (sport, expect_cid) in [(4000u16, 0u16), (4001, 1)] {
            let udp = udp_header(sport, 9000, 0, 4);
            let mut packet = common::ipv4_header(
                step.wrapping_mul(2) + u16::from(sport == 4001),
                17,
                [10, 0, 0, 1],
                [10, 0, 0, 2],
                udp.len() + 4,
            );
            packet.extend_from_slice(&udp);
            packet.extend_from_slice(&[9, 9, 9, 9]);

            let compressed = compressor.compress(&packet).unwrap();
            assert_eq!(compressed.cid, expect_cid);
            if expect_cid == 0 {
                // CID 0 has no Add-CID octet
                assert_ne!(compressed.packet[0] & 0xf0, 0xe0);
            } else {
                assert_eq!(compressed.packet[0], 0xe1);
            }

            let outcome = decompressor.decompress(compressed.packet).unwrap();
            assert_eq!(outcome.cid, Some(expect_cid));
            assert_eq!(outcome.packet.unwrap(), &packet[..]);
        }
    }
}

#[test]
fn large_cid_500_uses_two_sdvl_octets() {
    let profiles = &[ProfileId::Udp];
    let mut compressor = Compressor::new(1023, CidType::Large, profiles);
    let mut decompressor = Decompressor::new(1023, CidType::Large, profiles);

    // Fill CIDs 0..=499 with distinct IPv6/UDP flows, then land on 500
    let mut last = None;
    for flow in 0u16..=500 {
        let udp = udp_header(10_000 + flow, 5300, 0xbeef, 4);
        let mut packet = ipv6_header(17, [0x20; 16], [0x21; 16], udp.len() + 4);
        packet.extend_from_slice(&udp);
        packet.extend_from_slice(&[1, 2, 3, 4]);

        let compressed = compressor.compress(&packet).unwrap();
        assert_eq!(compressed.cid, flow);
        let outcome = decompressor.decompress(compressed.packet).unwrap();
        assert_eq!(outcome.cid, Some(flow));
        assert_eq!(outcome.packet.unwrap(), &packet[..]);
        last = Some(compressed.packet.to_vec());
    }

    // 500 = 10xxxxxx xxxxxxxx in SDVL, right after the type octet
    let last = last.unwrap();
    assert_eq!(&last[1..3], &[0b1000_0001, 0b1111_0100]);
}

#[test]
fn r_mode_acks_gate_the_state_machine() {
    let mut compressor = Compressor::new(15, CidType::Small, RTP_PROFILES);
    let mut decompressor = Decompressor::new(15, CidType::Small, RTP_PROFILES);
    decompressor.set_target_mode(Mode::Reliable);

    let payload = [0u8; 8];
    let mut steady = 0;
    for sn in 0u16..40 {
        let packet = rtp_packet(sn, 42 + sn, 8000 + 160 * u32::from(sn), 0x1234_5678, false, &payload);
        let compressed = compressor.compress(&packet).unwrap();
        if compressed.packet.len() == 1 + payload.len() {
            steady += 1;
        }
        let outcome = decompressor.decompress(compressed.packet).unwrap();
        assert_eq!(outcome.packet.unwrap(), &packet[..]);
        // Every reference-advancing packet is acknowledged in R-mode
        let feedback = outcome.feedback.expect("R-mode must ACK");
        compressor.deliver_feedback(&feedback).unwrap();
    }
    // IR until ACK(IR), FO until ACK(FO), then UO-0 steady state
    assert!(steady >= 30, "only {steady} steady-state packets");
}

#[test]
fn segmentation_reassembles_large_units() {
    let profiles = &[ProfileId::Udp];
    let mut compressor = Compressor::new(15, CidType::Small, profiles);
    let mut decompressor = Decompressor::new(15, CidType::Small, profiles);
    compressor.set_mrru(2000);
    decompressor.set_mrru(2000);

    let udp = udp_header(6000, 6001, 0, 600);
    let mut packet = common::ipv4_header(7, 17, [10, 9, 9, 1], [10, 9, 9, 2], udp.len() + 600);
    packet.extend_from_slice(&udp);
    packet.extend_from_slice(&[0x5a; 600]);

    let compressed = compressor.compress(&packet).unwrap().packet.to_vec();
    let segments = compressor.segment(&compressed, 128).unwrap();
    assert!(segments.len() > 1);

    for (index, segment) in segments.iter().enumerate() {
        let outcome = decompressor.decompress(segment).unwrap();
        if index + 1 < segments.len() {
            assert_eq!(outcome.status, DecompressStatus::Segment);
            assert!(outcome.packet.is_none());
        } else {
            assert_eq!(outcome.status, DecompressStatus::Packet);
            assert_eq!(outcome.packet.unwrap(), &packet[..]);
        }
    }
}

#[test]
fn piggybacked_feedback_round_trip() {
    // Two unidirectional channels: A->B data, B->A data with feedback
    // for A piggybacked on B's packets
    let mut comp_a = Compressor::new(15, CidType::Small, RTP_PROFILES);
    let mut decomp_b = Decompressor::new(15, CidType::Small, RTP_PROFILES);
    decomp_b.set_target_mode(Mode::Optimistic);
    let mut comp_b = Compressor::new(15, CidType::Small, RTP_PROFILES);
    let mut decomp_a = Decompressor::new(15, CidType::Small, RTP_PROFILES);

    for sn in 0u16..20 {
        let forward = rtp_packet(sn, sn, 160 * u32::from(sn), 0xaaaa_0001, false, b"fw");
        let compressed = comp_a.compress(&forward).unwrap();
        let outcome = decomp_b.decompress(compressed.packet).unwrap();
        assert_eq!(outcome.packet.unwrap(), &forward[..]);
        if let Some(feedback) = outcome.feedback {
            comp_b.queue_piggyback(&feedback);
        }

        let reverse = rtp_packet(sn, sn, 160 * u32::from(sn), 0xbbbb_0002, false, b"rv");
        let compressed = comp_b.compress(&reverse).unwrap();
        let outcome = decomp_a.decompress(compressed.packet).unwrap();
        assert_eq!(outcome.packet.unwrap(), &reverse[..]);
        if let Some(received) = outcome.received_feedback {
            comp_a.deliver_feedback(&received).unwrap();
        }
    }
}

#[test]
fn ir_crc_failure_reports_the_right_cid() {
    let profiles = &[ProfileId::Udp, ProfileId::Ip];
    let mut compressor = Compressor::new(15, CidType::Small, profiles);
    let mut decompressor = Decompressor::new(15, CidType::Small, profiles);

    let flow_packet = |sport: u16| {
        let udp = udp_header(sport, 9000, 0, 0);
        let mut packet =
            common::ipv4_header(1, 17, [10, 0, 0, 1], [10, 0, 0, 2], udp.len());
        packet.extend_from_slice(&udp);
        packet
    };

    // Flow one takes CID 0, flow two arrives on CID 1 with an Add-CID
    let first = compressor.compress(&flow_packet(4000)).unwrap().packet.to_vec();
    decompressor.decompress(&first).unwrap();
    let mut second = compressor.compress(&flow_packet(4001)).unwrap().packet.to_vec();
    assert_eq!(second[0], 0xe1);

    // Corrupt a static-chain octet; the failure must name CID 1
    second[5] ^= 0xff;
    assert_eq!(
        decompressor.decompress(&second).err(),
        Some(RohcError::CrcFailure { cid: 1 })
    );
}

#[test]
fn disabled_profile_reports_unsupported() {
    let mut decompressor = Decompressor::new(15, CidType::Small, &[ProfileId::Udp]);
    let mut compressor = Compressor::new(15, CidType::Small, RTP_PROFILES);

    let packet = rtp_packet(1, 1, 160, 0x7777_7777, false, b"x");
    let compressed = compressor.compress(&packet).unwrap();
    assert_eq!(compressed.profile, ProfileId::Rtp);
    assert_eq!(
        decompressor.decompress(compressed.packet).err(),
        Some(RohcError::ProfileUnsupported(0x0001))
    );
}
