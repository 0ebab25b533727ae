// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Canonical SIP call flows against a scripted peer over real UDP.

use parking_lot::Mutex;
use std::net::UdpSocket;
use std::sync::Arc;
use std::time::{Duration, Instant};
use umcore::config::Config;
use umcore::sip::dialog::SipDialog;
use umcore::sip::interface::{MtHandler, SipContext, SipInterface};
use umcore::sip::msg::SipMessage;
use umcore::sip::parse::parse_message;
use umcore::sip::sdp::{Codec, CodecSet};
use umcore::sip::{DialogMessage, DialogSink, DialogState, DialogType};

struct Collect(Mutex<Vec<DialogMessage>>);

impl DialogSink for Collect {
    fn dialog_message(&self, msg: DialogMessage) {
        self.0.lock().push(msg);
    }
}

fn wait_for<F: Fn() -> bool>(what: &str, cond: F) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(10));
    }
}

fn recv_sip(sock: &UdpSocket) -> SipMessage {
    let mut buf = [0u8; 4096];
    let (n, _) = sock.recv_from(&mut buf).expect("peer receive");
    parse_message(&buf[..n]).expect("peer parse")
}

/// Spec scenario: MO INVITE; peer answers 100/180/200; expect the state
/// ladder Started -> Proceeding -> Ringing -> Active, and an ACK whose To
/// tag comes from the 200, with the INVITE's branch and CSeq `1 ACK`.
#[test]
fn mo_invite_canonical_flow() {
    let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
    peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let peer_addr = peer.local_addr().unwrap();

    let cfg = Arc::new(Config::new());
    cfg.set("SIP.Local.IP", "127.0.0.1");
    cfg.set("SIP.Local.Port", "0");
    cfg.set("SIP.Proxy.Speech", &peer_addr.to_string());
    let ctx = SipContext::new(cfg, None).unwrap();
    let sink = Arc::new(Collect(Mutex::new(Vec::new())));
    ctx.set_sink(sink.clone());
    let iface = SipInterface::new(ctx.clone());
    iface.start();

    let dlg = SipDialog::new_mo(ctx.clone(), DialogType::Moc, 42, "IMSI001010000000001", "411");
    iface.add_dialog(&dlg);
    dlg.moc_send_invite(&CodecSet::gsm_only());

    let invite = recv_sip(&peer);
    assert!(invite.is_invite());
    assert_eq!(invite.cseq_num, 1);
    let branch = invite.branch().to_string();
    assert!(branch.starts_with("z9hG4bK"));
    assert!(invite.body.contains("m=audio"));

    // 100 Trying.
    let trying = SipMessage::reply(&invite, 100, "Trying", None);
    peer.send_to(trying.generate("peer").as_bytes(), invite.top_via().unwrap().sent_by.clone())
        .unwrap();
    // 180 Ringing with the peer's tag.
    let mut ringing = SipMessage::reply(&invite, 180, "Ringing", None);
    ringing.to.set_tag("peertag1");
    peer.send_to(ringing.generate("peer").as_bytes(), invite.top_via().unwrap().sent_by.clone())
        .unwrap();
    // 200 OK with the SDP answer on port 20000.
    let mut ok = SipMessage::reply(&invite, 200, "OK", None);
    ok.to.set_tag("peertag1");
    ok.add_body(
        "application/sdp",
        "v=0\r\no=peer 1 1 IN IP4 127.0.0.1\r\ns=Talk Time\r\nt=0 0\r\n\
m=audio 20000 RTP/AVP 3\r\nc=IN IP4 127.0.0.1\r\na=rtpmap:3 GSM/8000\r\n",
    );
    peer.send_to(ok.generate("peer").as_bytes(), invite.top_via().unwrap().sent_by.clone())
        .unwrap();

    // The UAC core emits the ACK.
    let ack = recv_sip(&peer);
    assert!(ack.is_ack());
    assert_eq!(ack.cseq_num, 1);
    assert_eq!(ack.cseq_method, "ACK");
    assert_eq!(ack.vias.len(), 1);
    assert_eq!(ack.branch(), branch);
    assert_eq!(ack.to.tag, "peertag1");
    assert_eq!(ack.call_id, invite.call_id);

    wait_for("dialog Active", || dlg.is_active());
    assert_eq!(dlg.remote_tag(), "peertag1");
    assert_ne!(dlg.rtp_port(), 0, "RTP not bound");
    assert_eq!(dlg.codec(), Codec::GsmFr);

    // Forward-only state ladder.
    let states: Vec<DialogState> = sink.0.lock().iter().map(|m| m.state).collect();
    let expect = [
        DialogState::Started,
        DialogState::Proceeding,
        DialogState::Ringing,
        DialogState::Active,
    ];
    let mut it = states.iter();
    for want in expect {
        assert!(
            it.any(|&s| s == want),
            "missing state {want:?} in {states:?}"
        );
    }
    ctx.stop();
}

/// Spec property: a CANCEL on a Proceeding MO dialog, answered by a 487,
/// draws an ACK from the transaction layer carrying the INVITE's top via
/// and the 487's to-tag.
#[test]
fn mo_cancel_draws_tl_ack() {
    let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
    peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let peer_addr = peer.local_addr().unwrap();

    let cfg = Arc::new(Config::new());
    cfg.set("SIP.Local.IP", "127.0.0.1");
    cfg.set("SIP.Local.Port", "0");
    cfg.set("SIP.Proxy.Speech", &peer_addr.to_string());
    let ctx = SipContext::new(cfg, None).unwrap();
    let iface = SipInterface::new(ctx.clone());
    iface.start();

    let dlg = SipDialog::new_mo(ctx.clone(), DialogType::Moc, 5, "IMSI001010000000001", "411");
    iface.add_dialog(&dlg);
    dlg.moc_send_invite(&CodecSet::gsm_only());

    let invite = recv_sip(&peer);
    let to_us = invite.top_via().unwrap().sent_by.clone();
    let trying = SipMessage::reply(&invite, 100, "Trying", None);
    peer.send_to(trying.generate("peer").as_bytes(), to_us.as_str()).unwrap();
    wait_for("proceeding", || {
        dlg.sip_state() == umcore::sip::SipState::Proceeding
    });

    dlg.dialog_cancel(umcore::sip::TermCause::NormalRelease);
    let cancel = recv_sip(&peer);
    assert!(cancel.is_cancel());
    assert_eq!(cancel.cseq_num, invite.cseq_num);
    assert_eq!(cancel.branch(), invite.branch());

    // Answer the CANCEL, then finalize the INVITE with 487.
    let cancel_ok = SipMessage::reply(&cancel, 200, "OK", None);
    peer.send_to(cancel_ok.generate("peer").as_bytes(), to_us.as_str()).unwrap();
    let mut final_487 = SipMessage::reply(&invite, 487, "Request Terminated", None);
    final_487.to.set_tag("peercanceltag");
    peer.send_to(final_487.generate("peer").as_bytes(), to_us.as_str()).unwrap();

    // The transaction layer ACKs the non-2xx final response.
    let ack = recv_sip(&peer);
    assert!(ack.is_ack());
    assert_eq!(ack.branch(), invite.branch(), "ACK must reuse the INVITE's top via");
    assert_eq!(ack.to.tag, "peercanceltag", "ACK must carry the 487's to-tag");
    assert_eq!(ack.cseq_num, invite.cseq_num);
    ctx.stop();
}

struct RingOnly;

impl MtHandler for RingOnly {
    fn new_mt_dialog(&self, dialog: Arc<SipDialog>, _request: &SipMessage) {
        dialog.mtc_send_trying();
        dialog.mtc_send_ringing();
    }
}

/// Spec scenario: MT INVITE, then CANCEL before answer. Expect 100 and
/// 180, then a 487 on the INVITE transaction and a 200 for the CANCEL;
/// the dialog winds up canceled with no RTP session.
#[test]
fn mt_invite_early_cancel() {
    let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
    peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let peer_addr = peer.local_addr().unwrap();

    let cfg = Arc::new(Config::new());
    cfg.set("SIP.Local.IP", "127.0.0.1");
    cfg.set("SIP.Local.Port", "0");
    let ctx = SipContext::new(cfg, None).unwrap();
    let sink = Arc::new(Collect(Mutex::new(Vec::new())));
    ctx.set_sink(sink.clone());
    let iface = SipInterface::new(ctx.clone());
    iface.set_mt_handler(Arc::new(RingOnly));

    let invite = b"INVITE sip:IMSI001010000000001@127.0.0.1 SIP/2.0\r\n\
Via: SIP/2.0/UDP 127.0.0.1:5099;branch=z9hG4bKpeerbranch001\r\n\
From: <sip:2600@127.0.0.1>;tag=peertagmt\r\n\
To: <sip:IMSI001010000000001@127.0.0.1>\r\n\
Call-ID: mtcancel1\r\nCSeq: 1 INVITE\r\n\
Content-Type: application/sdp\r\nContent-Length: 0\r\n\r\n";
    iface.on_datagram(invite, peer_addr);

    let trying = recv_sip(&peer);
    assert_eq!(trying.code, 100);
    let ringing = recv_sip(&peer);
    assert_eq!(ringing.code, 180);
    assert!(!ringing.to.tag.is_empty(), "MT responses carry our tag");

    let cancel = b"CANCEL sip:IMSI001010000000001@127.0.0.1 SIP/2.0\r\n\
Via: SIP/2.0/UDP 127.0.0.1:5099;branch=z9hG4bKpeerbranch001\r\n\
From: <sip:2600@127.0.0.1>;tag=peertagmt\r\n\
To: <sip:IMSI001010000000001@127.0.0.1>\r\n\
Call-ID: mtcancel1\r\nCSeq: 1 CANCEL\r\nContent-Length: 0\r\n\r\n";
    iface.on_datagram(cancel, peer_addr);

    let rsp1 = recv_sip(&peer);
    let rsp2 = recv_sip(&peer);
    let (invite_final, cancel_ok) = if rsp1.cseq_method == "INVITE" {
        (rsp1, rsp2)
    } else {
        (rsp2, rsp1)
    };
    assert_eq!(invite_final.code, 487);
    assert_eq!(invite_final.cseq_method, "INVITE");
    assert_eq!(cancel_ok.code, 200);
    assert_eq!(cancel_ok.cseq_method, "CANCEL");

    let dlg = iface.find_dialog("mtcancel1", "").expect("dialog still mapped");
    assert_eq!(dlg.rtp_port(), 0, "no RTP session may be opened");
    let states: Vec<DialogState> = sink.0.lock().iter().map(|m| m.state).collect();
    assert!(states.contains(&DialogState::Bye), "cancel not published: {states:?}");
}

/// Duplicate INVITEs are answered with the most recent response, not a
/// fresh trip through L3.
#[test]
fn mt_duplicate_invite_resends_response() {
    let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
    peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let peer_addr = peer.local_addr().unwrap();

    let cfg = Arc::new(Config::new());
    cfg.set("SIP.Local.IP", "127.0.0.1");
    cfg.set("SIP.Local.Port", "0");
    let ctx = SipContext::new(cfg, None).unwrap();
    let iface = SipInterface::new(ctx.clone());
    iface.set_mt_handler(Arc::new(RingOnly));

    let invite = b"INVITE sip:IMSI001010000000001@127.0.0.1 SIP/2.0\r\n\
Via: SIP/2.0/UDP 127.0.0.1:5099;branch=z9hG4bKpeerbranch002\r\n\
From: <sip:2600@127.0.0.1>;tag=peertagdup\r\n\
To: <sip:IMSI001010000000001@127.0.0.1>\r\n\
Call-ID: mtdup1\r\nCSeq: 1 INVITE\r\nContent-Length: 0\r\n\r\n";
    iface.on_datagram(invite, peer_addr);
    let _trying = recv_sip(&peer);
    let _ringing = recv_sip(&peer);

    // Retransmitted INVITE: the 180 comes again (after the throttle).
    std::thread::sleep(Duration::from_millis(120));
    iface.on_datagram(invite, peer_addr);
    let resent = recv_sip(&peer);
    assert_eq!(resent.code, 180);
}
