//! End-to-end tuple distribution over a two-component overlay: pushed
//! values, write stamps from the owner's clock, large values riding the
//! long-message plane, and append streams.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use mycel_core::{Clock, PeerId, Timestamp};
use mycel_net::iface::mem::{MemDriver, MemRegistry};
use mycel_net::{Kernel, NetConfig};
use mycel_tuples::{Tuple, TupleService};

const DT: Duration = Duration::from_millis(100);

fn node(id: i32, hostname: &str, registry: &MemRegistry) -> (Kernel, TupleService) {
    let mut config = NetConfig::default();
    config.id = Some(id);
    config.hostname = hostname.to_string();
    config.route_broadcast_period = 0.5;
    config.connmgr_period = 0.5;
    config.hostinfo_period = 1.0;

    let start = Timestamp::from_parts(1_000_000, 0);
    let mut kernel = Kernel::with_clock(config, Clock::manual(start));
    let tuples = TupleService::attach(&mut kernel);

    let core = kernel.core_mut();
    let driver = MemDriver::new(registry.clone(), hostname);
    let index = core.add_driver(Box::new(driver));
    core.listen_on(index, 8000).expect("listen");
    (kernel, tuples)
}

fn run(kernels: &mut [&mut Kernel], steps: usize) {
    for _ in 0..steps {
        for kernel in kernels.iter_mut() {
            kernel.core_mut().clock.advance(DT);
            kernel.step();
        }
    }
}

fn converge(a: &mut Kernel, b: &mut Kernel) {
    let url = "tcp://producer:8000".parse().expect("url");
    b.core_mut().connect_url(&url).expect("dial");
    for _ in 0..100 {
        a.core_mut().clock.advance(DT);
        a.step();
        b.core_mut().clock.advance(DT);
        b.step();
        if a.core().router.route_for(&PeerId(20)).is_some()
            && b.core().router.route_for(&PeerId(10)).is_some()
        {
            return;
        }
    }
    panic!("overlay did not converge");
}

#[test]
fn subscriber_receives_the_produced_value_with_the_owner_stamp() {
    let registry = MemRegistry::new();
    let (mut producer, producer_tuples) = node(10, "producer", &registry);
    let (mut consumer, consumer_tuples) = node(20, "consumer", &registry);
    converge(&mut producer, &mut consumer);

    let seen: Arc<Mutex<Vec<(Vec<u8>, Timestamp)>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = seen.clone();
        consumer_tuples.register_callback(
            PeerId(10),
            "data.*",
            Box::new(move |tuple| {
                seen.lock().expect("lock").push((tuple.data.clone(), tuple.ts_write));
            }),
        );
    }

    consumer_tuples
        .subscribe(consumer.core_mut(), PeerId(10), "data.*")
        .expect("subscribe");
    run(&mut [&mut producer, &mut consumer], 20);

    let set_at = producer.core().clock.now();
    producer_tuples
        .set(producer.core_mut(), Tuple::new(PeerId(10), "data.item", b"data-0".to_vec()))
        .expect("set");
    run(&mut [&mut producer, &mut consumer], 30);

    let seen = seen.lock().expect("lock");
    assert_eq!(seen.len(), 1, "value-changed callback fires once");
    assert_eq!(seen[0].0, b"data-0".to_vec());
    // The write stamp is the producer's network clock at set time.
    assert!((seen[0].1 - set_at).abs() <= 50_000, "stamp within 50 ms of set");
}

#[test]
fn twelve_kib_tuple_arrives_whole() {
    let registry = MemRegistry::new();
    let (mut producer, producer_tuples) = node(10, "producer", &registry);
    let (mut consumer, consumer_tuples) = node(20, "consumer", &registry);
    converge(&mut producer, &mut consumer);

    let seen: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = seen.clone();
        consumer_tuples.register_callback(
            PeerId(10),
            "blob",
            Box::new(move |tuple| {
                seen.lock().expect("lock").push(tuple.data.clone());
            }),
        );
    }
    consumer_tuples.subscribe(consumer.core_mut(), PeerId(10), "blob").expect("subscribe");
    run(&mut [&mut producer, &mut consumer], 20);

    let payload: Vec<u8> = (0..12 * 1024).map(|i| (i % 249) as u8).collect();
    producer_tuples
        .set(producer.core_mut(), Tuple::new(PeerId(10), "blob", payload.clone()))
        .expect("set");
    run(&mut [&mut producer, &mut consumer], 60);

    let seen = seen.lock().expect("lock");
    assert_eq!(seen.len(), 1, "one callback for the whole value");
    assert_eq!(seen[0].len(), 12 * 1024);
    assert_eq!(seen[0], payload);
}

#[test]
fn append_stream_concatenates_in_owner_order() {
    let registry = MemRegistry::new();
    let (mut producer, producer_tuples) = node(10, "producer", &registry);
    let (mut consumer, consumer_tuples) = node(20, "consumer", &registry);
    converge(&mut producer, &mut consumer);

    consumer_tuples.subscribe(consumer.core_mut(), PeerId(10), "log").expect("subscribe");
    run(&mut [&mut producer, &mut consumer], 20);

    for chunk in [b"alpha-" as &[u8], b"beta-", b"gamma"] {
        producer_tuples
            .append(producer.core_mut(), PeerId(10), "log", chunk)
            .expect("append");
        run(&mut [&mut producer, &mut consumer], 10);
    }

    let tuple = consumer_tuples
        .get(consumer.core(), PeerId(10), "log")
        .expect("replicated tuple");
    assert_eq!(tuple.data, b"alpha-beta-gamma".to_vec());
}

#[test]
fn remote_append_is_serialised_by_the_owner() {
    let registry = MemRegistry::new();
    let (mut producer, producer_tuples) = node(10, "producer", &registry);
    let (mut consumer, consumer_tuples) = node(20, "consumer", &registry);
    converge(&mut producer, &mut consumer);

    // The consumer appends to a tuple the producer owns.
    consumer_tuples
        .append(consumer.core_mut(), PeerId(10), "shared.log", b"from-consumer")
        .expect("remote append");
    run(&mut [&mut producer, &mut consumer], 30);

    let tuple = producer_tuples
        .get(producer.core(), PeerId(10), "shared.log")
        .expect("owner applied the append");
    assert_eq!(tuple.data, b"from-consumer".to_vec());
    assert_eq!(tuple.owner, PeerId(10));
}
