//! Publish/subscribe fan-out and prefix filtering.

use capstan::{dev_tracing, Context, Msg, SocketOptions, SocketType};
use std::time::Duration;

fn quick() -> SocketOptions {
    SocketOptions::default().with_recv_timeout(Duration::from_millis(200))
}

#[test]
fn test_sub_filters_by_prefix() {
    dev_tracing::init_tracing();
    // Inproc needs no I/O thread, so the pipe exists as soon as connect
    // returns and there is no joiner race to dodge.
    let ctx = Context::builder().io_threads(0).build().unwrap();

    let mut publisher = ctx.socket(SocketType::Pub).unwrap();
    publisher.bind("inproc://filter").unwrap();

    let mut subscriber = ctx.socket(SocketType::Sub).unwrap();
    subscriber.set_options(quick()).unwrap();
    subscriber.connect("inproc://filter").unwrap();
    subscriber.subscribe("alpha").unwrap();

    publisher.send(Msg::from("alpha.1")).unwrap();
    publisher.send(Msg::from("beta.1")).unwrap();
    publisher.send(Msg::from("alpha.2")).unwrap();

    assert_eq!(subscriber.recv().unwrap().data(), b"alpha.1");
    assert_eq!(subscriber.recv().unwrap().data(), b"alpha.2");
    assert!(subscriber.recv().is_err(), "beta must be filtered out");

    publisher.close();
    subscriber.close();
    ctx.terminate().unwrap();
}

#[test]
fn test_unsubscribe_stops_delivery() {
    dev_tracing::init_tracing();
    let ctx = Context::builder().io_threads(0).build().unwrap();

    let mut publisher = ctx.socket(SocketType::Pub).unwrap();
    publisher.bind("inproc://unsub").unwrap();

    let mut subscriber = ctx.socket(SocketType::Sub).unwrap();
    subscriber.set_options(quick()).unwrap();
    subscriber.connect("inproc://unsub").unwrap();
    subscriber.subscribe("news").unwrap();

    publisher.send(Msg::from("news.1")).unwrap();
    assert_eq!(subscriber.recv().unwrap().data(), b"news.1");

    subscriber.unsubscribe(b"news").unwrap();
    publisher.send(Msg::from("news.2")).unwrap();
    assert!(subscriber.recv().is_err(), "unsubscribed topic still arrived");

    publisher.close();
    subscriber.close();
    ctx.terminate().unwrap();
}

#[test]
fn test_filter_drops_multipart_as_a_unit() {
    dev_tracing::init_tracing();
    let ctx = Context::builder().io_threads(0).build().unwrap();

    let mut publisher = ctx.socket(SocketType::Pub).unwrap();
    publisher.bind("inproc://atomic").unwrap();

    let mut subscriber = ctx.socket(SocketType::Sub).unwrap();
    subscriber.set_options(quick()).unwrap();
    subscriber.connect("inproc://atomic").unwrap();
    subscriber.subscribe("keep").unwrap();

    // The filter looks at the first frame only. A rejected topic must
    // take its payload frames down with it.
    publisher
        .send_multipart([Msg::from("drop"), Msg::from("orphan payload")])
        .unwrap();
    publisher
        .send_multipart([Msg::from("keep"), Msg::from("wanted payload")])
        .unwrap();

    let frames = subscriber.recv_multipart().unwrap();
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].data(), b"keep");
    assert_eq!(frames[1].data(), b"wanted payload");
    assert!(subscriber.recv().is_err());

    publisher.close();
    subscriber.close();
    ctx.terminate().unwrap();
}

#[test]
fn test_slow_subscriber_does_not_stall_the_fast_one() {
    dev_tracing::init_tracing();
    let ctx = Context::builder().io_threads(0).build().unwrap();

    let mut publisher = ctx.socket(SocketType::Pub).unwrap();
    publisher
        .set_options(SocketOptions::default().with_send_hwm(2))
        .unwrap();
    publisher.bind("inproc://congested").unwrap();

    // The slow subscriber never reads during the burst, so its pipe caps
    // out at the summed watermark of 4 and the publisher skips it.
    let mut slow = ctx.socket(SocketType::Sub).unwrap();
    slow.set_options(quick().with_recv_hwm(2)).unwrap();
    slow.connect("inproc://congested").unwrap();
    slow.subscribe("").unwrap();

    let mut fast = ctx.socket(SocketType::Sub).unwrap();
    fast.set_options(quick()).unwrap();
    fast.connect("inproc://congested").unwrap();
    fast.subscribe("").unwrap();

    for i in 0..20 {
        publisher.send(Msg::from(format!("m{i}"))).unwrap();
    }

    for i in 0..20 {
        assert_eq!(fast.recv().unwrap().data(), format!("m{i}").as_bytes());
    }

    let mut delivered = 0;
    while slow.recv().is_ok() {
        delivered += 1;
    }
    assert_eq!(delivered, 4, "slow pipe admits exactly its watermark");

    publisher.close();
    slow.close();
    fast.close();
    ctx.terminate().unwrap();
}

#[test]
fn test_two_subscribers_both_receive_over_tcp() {
    dev_tracing::init_tracing();
    let ctx = Context::builder().io_threads(2).build().unwrap();
    let port = portpicker::pick_unused_port().expect("no free port");
    let endpoint = format!("tcp://127.0.0.1:{port}");

    let mut publisher = ctx.socket(SocketType::Pub).unwrap();
    publisher.bind(&endpoint).unwrap();

    let mut sub_a = ctx.socket(SocketType::Sub).unwrap();
    sub_a.set_options(quick()).unwrap();
    sub_a.connect(&endpoint).unwrap();
    sub_a.subscribe("").unwrap();

    let mut sub_b = ctx.socket(SocketType::Sub).unwrap();
    sub_b.set_options(quick()).unwrap();
    sub_b.connect(&endpoint).unwrap();
    sub_b.subscribe("").unwrap();

    // A publisher drops messages for subscribers that have not finished
    // joining, so keep publishing warmups until both sides hear one.
    let mut a_ready = false;
    let mut b_ready = false;
    for _ in 0..100 {
        publisher.send(Msg::from("warmup")).unwrap();
        if !a_ready && sub_a.recv().is_ok() {
            a_ready = true;
        }
        if !b_ready && sub_b.recv().is_ok() {
            b_ready = true;
        }
        if a_ready && b_ready {
            break;
        }
    }
    assert!(a_ready && b_ready, "subscribers never joined");

    publisher.send(Msg::from("payload")).unwrap();
    for subscriber in [&mut sub_a, &mut sub_b] {
        loop {
            let msg = subscriber.recv().unwrap();
            if msg.data() == b"payload" {
                break;
            }
        }
    }

    publisher.close();
    sub_a.close();
    sub_b.close();
    ctx.terminate().unwrap();
}
