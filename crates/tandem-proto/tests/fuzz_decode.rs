use bytes::Bytes;
use rand::{thread_rng, Rng};
use tandem_proto::{
    classify_datagram, decode_msg, IceCandidate, PhysicalPacket, SessionParams, StunMessage,
    TANDEM_MAGIC, TANDEM_VERSION,
};

fn random_bytes(rng: &mut impl Rng, max: usize) -> Vec<u8> {
    let len: usize = rng.gen_range(0..max);
    let mut data = vec![0u8; len];
    rng.fill(&mut data[..]);
    data
}

#[test]
fn fuzz_decode_message_never_panics() {
    let mut rng = thread_rng();
    for _ in 0..10_000 {
        let data = random_bytes(&mut rng, 2048);
        let _ = decode_msg(&data);
    }
}

#[test]
fn fuzz_decode_physical_packet_never_panics() {
    let mut rng = thread_rng();
    for _ in 0..10_000 {
        let data = random_bytes(&mut rng, 2048);
        let _ = classify_datagram(&data);
        let _ = PhysicalPacket::decode(Bytes::from(data));
    }
}

#[test]
fn random_mutation_of_valid_header_is_handled() {
    let mut rng = thread_rng();
    let mut packet = vec![0u8; 18];
    packet[0..2].copy_from_slice(&TANDEM_MAGIC);
    packet[2..4].copy_from_slice(&TANDEM_VERSION.to_be_bytes());

    for _ in 0..1_000 {
        let mut mutated = packet.clone();
        let flip_count = rng.gen_range(1..6);
        for _ in 0..flip_count {
            let idx = rng.gen_range(0..mutated.len());
            mutated[idx] ^= rng.gen::<u8>();
        }
        let _ = PhysicalPacket::decode(Bytes::from(mutated));
    }
}

#[test]
fn random_mutation_of_stun_is_handled() {
    let mut rng = thread_rng();
    let peer = "192.0.2.44:9000".parse().unwrap();
    let valid = StunMessage::send_indication(peer, b"payload bytes").encode();

    for _ in 0..5_000 {
        let mut mutated = valid.clone();
        let flip_count = rng.gen_range(1..8);
        for _ in 0..flip_count {
            let idx = rng.gen_range(0..mutated.len());
            mutated[idx] ^= rng.gen::<u8>();
        }
        if rng.gen_bool(0.2) {
            let cut = rng.gen_range(0..mutated.len());
            mutated.truncate(cut);
        }
        let _ = StunMessage::decode(&mutated);
    }
}

#[test]
fn random_text_never_panics_parsers() {
    let mut rng = thread_rng();
    let alphabet = b"v=oamtc:0123456789 \r\nabcdefgh./+typhostsrflxrelay";
    for _ in 0..5_000 {
        let len = rng.gen_range(0..256);
        let text: String = (0..len)
            .map(|_| alphabet[rng.gen_range(0..alphabet.len())] as char)
            .collect();
        let _ = SessionParams::parse(&text);
        let _ = IceCandidate::parse(&format!("candidate:{text}"));
    }
}
