use crate::cbor::{
    self, PID_AGGREGATE_VERIFY, PID_BLIND_SIGN, PID_FETCH_G1, PID_FETCH_G2, PID_FETCH_PUBLIC_KEY,
    PID_REFUSED, PID_VERIFY, Packet,
};
use crate::net::{self, Server};
use crate::*;

use bls12_381::G1Projective;
use group::Group;
use rand_core::OsRng;
use std::sync::Arc;
use std::thread;

fn issue(issuer: &Issuer, helper: &Verifier) -> Receipt {
    let pre = helper.prepare(OsRng);
    let psi = issuer.blind_sign(pre.blinded());
    helper.finalize(&pre, &psi, issuer.public())
}

#[test]
fn exactly_once_acceptance() {
    let issuer = Issuer::random(HashAlg::default(), OsRng);
    let helper = Verifier::new(issuer.params().clone());

    for _ in 0..10 {
        let receipt = issue(&issuer, &helper);
        assert!(helper.verify(receipt.sigma(), &receipt.serial_bytes(), issuer.public().y2()));
        assert!(!helper.verify(receipt.sigma(), &receipt.serial_bytes(), issuer.public().y2()));
    }
    assert_eq!(helper.ledger().len(), 10);
}

#[test]
fn every_hash_choice_issues_and_verifies() {
    for hash in [HashAlg::Sha224, HashAlg::Sha256, HashAlg::Sha384, HashAlg::Sha512] {
        let issuer = Issuer::random(hash, OsRng);
        let helper = Verifier::new(issuer.params().clone());
        let receipt = issue(&issuer, &helper);
        assert!(helper.verify(receipt.sigma(), &receipt.serial_bytes(), issuer.public().y2()));
    }
}

#[test]
fn forged_sigma_rejected() {
    let issuer = Issuer::random(HashAlg::Sha256, OsRng);
    let helper = Verifier::new(issuer.params().clone());
    let receipt = issue(&issuer, &helper);

    let forged = G1Projective::random(&mut OsRng);
    assert!(!helper.verify(&forged, &receipt.serial_bytes(), issuer.public().y2()));
}

#[test]
fn failed_verification_does_not_consume_the_serial() {
    let issuer = Issuer::random(HashAlg::Sha256, OsRng);
    let helper = Verifier::new(issuer.params().clone());
    let receipt = issue(&issuer, &helper);

    let forged = G1Projective::random(&mut OsRng);
    assert!(!helper.verify(&forged, &receipt.serial_bytes(), issuer.public().y2()));
    // The genuine signature over the same serial must still be redeemable.
    assert!(helper.verify(receipt.sigma(), &receipt.serial_bytes(), issuer.public().y2()));
}

#[test]
fn oversized_serial_rejected() {
    let issuer = Issuer::random(HashAlg::Sha256, OsRng);
    let oversized = [0u8; SERIAL_LEN + 1];
    let sigma = G1Projective::random(&mut OsRng);
    assert!(!issuer.verifier().verify(&sigma, &oversized, issuer.public().y2()));
    assert!(issuer.verifier().ledger().is_empty());
}

#[test]
fn aggregation_roundtrip() {
    let issuer = Issuer::random(HashAlg::Sha256, OsRng);
    let helper = Verifier::new(issuer.params().clone());

    let receipts: Vec<Receipt> = (0..10).map(|_| issue(&issuer, &helper)).collect();
    let sigmas: Vec<G1Projective> = receipts.iter().map(|r| *r.sigma()).collect();
    let sigma_agg = helper.aggregate(&sigmas);
    let serials: Vec<Vec<u8>> = receipts.iter().map(|r| r.serial_bytes().to_vec()).collect();
    let keys = vec![*issuer.public().y2(); receipts.len()];

    assert!(helper.aggregate_verify(&sigma_agg, &serials, &keys));

    // A single bit-flipped serial fails the whole batch.
    let mut corrupted = serials.clone();
    corrupted[3][0] ^= 1;
    assert!(!helper.aggregate_verify(&sigma_agg, &corrupted, &keys));

    // As does one key swapped for a different valid key.
    let other = Issuer::with_params(issuer.params().clone(), OsRng);
    let mut swapped = keys.clone();
    swapped[7] = *other.public().y2();
    assert!(!helper.aggregate_verify(&sigma_agg, &serials, &swapped));

    // And mismatched list lengths never verify.
    assert!(!helper.aggregate_verify(&sigma_agg, &serials, &keys[..9]));
}

#[test]
fn aggregate_verification_leaves_serials_spendable() {
    let issuer = Issuer::random(HashAlg::Sha256, OsRng);
    let helper = Verifier::new(issuer.params().clone());
    let receipt = issue(&issuer, &helper);

    let sigma_agg = helper.aggregate(&[*receipt.sigma()]);
    let serials = vec![receipt.serial_bytes().to_vec()];
    let keys = vec![*issuer.public().y2()];

    assert!(helper.aggregate_verify(&sigma_agg, &serials, &keys));
    // The aggregate path does not record serials, so the receipt can still
    // be verified individually afterwards.
    assert!(helper.verify(receipt.sigma(), &receipt.serial_bytes(), issuer.public().y2()));
    // The individual verification did record it, so the batch now replays.
    assert!(!helper.aggregate_verify(&sigma_agg, &serials, &keys));
}

#[test]
fn concurrent_verification_has_a_single_winner() {
    let issuer = Arc::new(Issuer::random(HashAlg::Sha256, OsRng));
    let helper = Verifier::new(issuer.params().clone());
    let receipt = Arc::new(issue(&issuer, &helper));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let issuer = Arc::clone(&issuer);
            let receipt = Arc::clone(&receipt);
            thread::spawn(move || {
                issuer.verifier().verify(
                    receipt.sigma(),
                    &receipt.serial_bytes(),
                    issuer.public().y2(),
                ) as usize
            })
        })
        .collect();

    let wins: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(wins, 1);
    assert_eq!(issuer.verifier().ledger().len(), 1);
}

fn spawn_blocking_server(engine: Arc<Issuer>) -> std::net::SocketAddr {
    let server = Server::bind("127.0.0.1:0", engine).unwrap();
    let addr = server.local_addr().unwrap();
    thread::spawn(move || server.serve_blocking());
    addr
}

#[test]
fn end_to_end_over_blocking_transport() {
    let engine = Arc::new(Issuer::random(HashAlg::Sha256, OsRng));
    let addr = spawn_blocking_server(Arc::clone(&engine));

    // The helper bootstraps the issuer's parameters over the wire.
    let fetch = |pid| {
        net::request(
            addr,
            &Packet {
                pid,
                ..Packet::default()
            },
        )
        .unwrap()
    };
    let key_resp = fetch(PID_FETCH_PUBLIC_KEY);
    assert_eq!(key_resp.pid, PID_FETCH_PUBLIC_KEY);
    let y2 = cbor::decode_g2(key_resp.e1.as_deref().unwrap()).unwrap();
    let y1 = cbor::decode_g1(key_resp.e2.as_deref().unwrap()).unwrap();
    let g1 = cbor::decode_g1(fetch(PID_FETCH_G1).e1.as_deref().unwrap()).unwrap();
    let g2 = cbor::decode_g2(fetch(PID_FETCH_G2).e1.as_deref().unwrap()).unwrap();
    assert_eq!(y2, *engine.public().y2());

    let key = PublicKey::new(y1, y2);
    let helper = Verifier::new(Params::new(HashAlg::Sha256, g1, g2));

    let pre = helper.prepare(OsRng);
    let sign_resp = net::request(
        addr,
        &Packet {
            pid: PID_BLIND_SIGN,
            e1: Some(cbor::encode_g1(pre.blinded())),
            ..Packet::default()
        },
    )
    .unwrap();
    assert_eq!(sign_resp.pid, PID_BLIND_SIGN);
    let psi = cbor::decode_g1(sign_resp.e1.as_deref().unwrap()).unwrap();
    let receipt = helper.finalize(&pre, &psi, &key);

    let verify_req = Packet {
        pid: PID_VERIFY,
        e1: Some(cbor::encode_g1(receipt.sigma())),
        e2: Some(receipt.serial_bytes().to_vec()),
        e3: Some(cbor::encode_g2(&y2)),
        ..Packet::default()
    };
    let resp = net::request(addr, &verify_req).unwrap();
    assert_eq!(resp.pid, PID_VERIFY);
    assert_eq!(resp.is_valid, Some(true));

    // Replaying the same receipt is rejected by the server's ledger.
    let resp = net::request(addr, &verify_req).unwrap();
    assert_eq!(resp.is_valid, Some(false));
}

#[test]
fn aggregate_verification_over_the_wire() {
    let engine = Arc::new(Issuer::random(HashAlg::Sha256, OsRng));
    let addr = spawn_blocking_server(Arc::clone(&engine));
    let helper = Verifier::new(engine.params().clone());

    let receipts: Vec<Receipt> = (0..3).map(|_| issue(&engine, &helper)).collect();
    let sigmas: Vec<G1Projective> = receipts.iter().map(|r| *r.sigma()).collect();
    let sigma_agg = helper.aggregate(&sigmas);
    let y_bytes = cbor::encode_g2(engine.public().y2());

    let request = Packet {
        pid: PID_AGGREGATE_VERIFY,
        e1: Some(cbor::encode_g1(&sigma_agg)),
        e_list1: Some(
            receipts
                .iter()
                .map(|r| Some(r.serial_bytes().to_vec()))
                .collect(),
        ),
        e_list2: Some(receipts.iter().map(|_| Some(y_bytes.clone())).collect()),
        ..Packet::default()
    };
    let resp = net::request(addr, &request).unwrap();
    assert_eq!(resp.pid, PID_AGGREGATE_VERIFY);
    assert_eq!(resp.is_valid, Some(true));

    // A sparse serial entry makes the batch invalid rather than an error.
    let mut sparse = request.clone();
    sparse.e_list1.as_mut().unwrap()[1] = None;
    let resp = net::request(addr, &sparse).unwrap();
    assert_eq!(resp.is_valid, Some(false));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn end_to_end_over_async_transport() {
    let engine = Arc::new(Issuer::random(HashAlg::Sha256, OsRng));
    let server = Server::bind("127.0.0.1:0", Arc::clone(&engine)).unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.serve());

    let helper = Verifier::new(engine.params().clone());
    let pre = helper.prepare(OsRng);
    let sign_resp = net::request_async(
        addr,
        &Packet {
            pid: PID_BLIND_SIGN,
            e1: Some(cbor::encode_g1(pre.blinded())),
            ..Packet::default()
        },
    )
    .await
    .unwrap();
    let psi = cbor::decode_g1(sign_resp.e1.as_deref().unwrap()).unwrap();
    let receipt = helper.finalize(&pre, &psi, engine.public());

    let verify_req = Packet {
        pid: PID_VERIFY,
        e1: Some(cbor::encode_g1(receipt.sigma())),
        e2: Some(receipt.serial_bytes().to_vec()),
        e3: Some(cbor::encode_g2(engine.public().y2())),
        ..Packet::default()
    };
    let resp = net::request_async(addr, &verify_req).await.unwrap();
    assert_eq!(resp.is_valid, Some(true));
    let resp = net::request_async(addr, &verify_req).await.unwrap();
    assert_eq!(resp.is_valid, Some(false));
}

#[test]
fn authorization_hook_refuses_without_touching_the_engine() {
    let engine = Arc::new(Issuer::random(HashAlg::Sha256, OsRng));
    let server = Server::bind("127.0.0.1:0", Arc::clone(&engine))
        .unwrap()
        .auth_hook(|_| false);
    let addr = server.local_addr().unwrap();
    thread::spawn(move || server.serve_blocking());

    let helper = Verifier::new(engine.params().clone());
    let receipt = issue(&engine, &helper);

    let verify_req = Packet {
        pid: PID_VERIFY,
        e1: Some(cbor::encode_g1(receipt.sigma())),
        e2: Some(receipt.serial_bytes().to_vec()),
        e3: Some(cbor::encode_g2(engine.public().y2())),
        ..Packet::default()
    };
    let resp = net::request(addr, &verify_req).unwrap();
    assert_eq!(resp.pid, PID_REFUSED);
    assert_eq!(resp.is_valid, None);

    for pid in [PID_BLIND_SIGN, PID_AGGREGATE_VERIFY, PID_FETCH_PUBLIC_KEY] {
        let resp = net::request(
            addr,
            &Packet {
                pid,
                ..Packet::default()
            },
        )
        .unwrap();
        assert_eq!(resp.pid, PID_REFUSED);
    }

    // No cryptographic computation happened: the refused serial is still
    // fresh in the engine's ledger.
    assert!(engine.verifier().ledger().is_empty());
    assert!(engine.verifier().verify(
        receipt.sigma(),
        &receipt.serial_bytes(),
        engine.public().y2()
    ));
}

#[test]
fn unknown_operation_id_closes_the_connection() {
    let engine = Arc::new(Issuer::random(HashAlg::Sha256, OsRng));
    let addr = spawn_blocking_server(engine);

    let err = net::request(
        addr,
        &Packet {
            pid: 42,
            ..Packet::default()
        },
    )
    .unwrap_err();
    assert!(matches!(err, net::Error::Disconnected));
}

#[test]
fn zero_length_frame_is_ignored() {
    use std::io::{Read, Write};

    let engine = Arc::new(Issuer::random(HashAlg::Sha256, OsRng));
    let addr = spawn_blocking_server(engine);

    let mut stream = std::net::TcpStream::connect(addr).unwrap();
    stream.write_all(&0u32.to_be_bytes()).unwrap();
    let mut buf = [0u8; 1];
    // The server treats the empty frame as "no message" and closes without
    // replying.
    assert_eq!(stream.read(&mut buf).unwrap(), 0);
}

#[test]
fn malformed_element_fails_the_request() {
    let engine = Arc::new(Issuer::random(HashAlg::Sha256, OsRng));
    let addr = spawn_blocking_server(engine);

    // 48 zero bytes are not a valid compressed G1 element; the server drops
    // the connection instead of substituting a default element.
    let err = net::request(
        addr,
        &Packet {
            pid: PID_BLIND_SIGN,
            e1: Some(vec![0u8; G1_LEN]),
            ..Packet::default()
        },
    )
    .unwrap_err();
    assert!(matches!(err, net::Error::Disconnected));
}
