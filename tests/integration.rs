use std::net::UdpSocket;
use std::thread;
use std::time::Duration;

use mpipe::multiplexer::{Config, Multiplexer};
use mpipe::socket::SocketConfig;
use mpipe::wire::GatherOp;

/// Binds to an ephemeral port and immediately releases it. Small race
/// between release and reuse, acceptable for test purposes.
fn free_port() -> u16 {
    let socket = UdpSocket::bind(("127.0.0.1", 0)).expect("bind ephemeral port");
    socket.local_addr().unwrap().port()
}

fn test_config() -> Config {
    Config::default()
        .with_connection_wait_timeout(Duration::from_millis(20))
        .with_ping_timeout(Duration::from_millis(200))
        .with_max_ping_requests(20)
        .with_receive_wait_timeout(Duration::from_millis(20))
        .with_barrier_wait_timeout(Duration::from_millis(20))
}

/// Sets up one master and one slave over loopback UDP, unicast (the slave
/// group address is a plain loopback address, not a multicast one, since a
/// single-slave pair needs no fan-out) and waits for both to connect.
fn spawn_connected_pair(send_buffer_size: usize) -> (Multiplexer, Multiplexer) {
    let master_port = free_port();
    let slave_port = free_port();

    let master_socket_config = SocketConfig {
        node_index: 0,
        master_host: "127.0.0.1".to_string(),
        master_port,
        slave_group: "127.0.0.1".to_string(),
        slave_port,
    };
    let slave_socket_config = SocketConfig {
        node_index: 1,
        master_host: "127.0.0.1".to_string(),
        master_port,
        slave_group: "127.0.0.1".to_string(),
        slave_port,
    };

    let config = test_config().with_send_buffer_size(send_buffer_size);

    let master =
        Multiplexer::with_config(0, 1, master_socket_config, config.clone()).expect("master sets up");
    let slave = Multiplexer::with_config(1, 1, slave_socket_config, config).expect("slave sets up");

    master.wait_for_connection().expect("master connects");
    slave.wait_for_connection().expect("slave connects");

    (master, slave)
}

#[test]
fn connects_and_opens_matching_pipe_ids() {
    let (master, slave) = spawn_connected_pair(50);
    assert!(master.is_connected());
    assert!(slave.is_connected());

    let master_pipe = master.open_pipe().expect("master opens pipe");
    let slave_pipe = slave.open_pipe().expect("slave opens pipe");
    assert_eq!(master_pipe, slave_pipe);
}

#[test]
fn delivers_packets_in_order() {
    let (master, slave) = spawn_connected_pair(50);
    let pipe = master.open_pipe().expect("master opens pipe");
    slave.open_pipe().expect("slave opens pipe");

    let messages: Vec<Vec<u8>> = (0u8..10).map(|i| vec![i; 4]).collect();
    let sent = messages.clone();
    let sender = thread::spawn(move || {
        for msg in &sent {
            master.send_packet(pipe, msg).expect("send succeeds");
        }
        master
    });

    for expected in &messages {
        let got = slave.receive_packet(pipe).expect("receive succeeds");
        assert_eq!(&got, expected);
    }

    sender.join().expect("sender thread completes");
}

#[test]
fn gather_sum_reduces_both_values() {
    let (master, slave) = spawn_connected_pair(50);
    let pipe = master.open_pipe().expect("master opens pipe");
    slave.open_pipe().expect("slave opens pipe");

    let slave_thread =
        thread::spawn(move || slave.gather(pipe, 30, GatherOp::Sum).expect("slave gathers"));
    let master_result = master.gather(pipe, 12, GatherOp::Sum).expect("master gathers");
    let slave_result = slave_thread.join().expect("slave thread completes");

    assert_eq!(master_result, 42);
    assert_eq!(slave_result, 42);
}

#[test]
fn barrier_synchronizes_across_repeated_rounds() {
    let (master, slave) = spawn_connected_pair(50);
    let pipe = master.open_pipe().expect("master opens pipe");
    slave.open_pipe().expect("slave opens pipe");

    let slave_thread = thread::spawn(move || {
        for _ in 0..3 {
            slave.barrier(pipe).expect("slave barrier");
        }
    });

    for _ in 0..3 {
        master.barrier(pipe).expect("master barrier");
    }

    slave_thread.join().expect("slave thread completes");
}

#[test]
fn send_packet_backpressure_does_not_lose_data() {
    let (master, slave) = spawn_connected_pair(2);
    let pipe = master.open_pipe().expect("master opens pipe");
    slave.open_pipe().expect("slave opens pipe");

    let sender = thread::spawn(move || {
        for i in 0..10u8 {
            master.send_packet(pipe, &[i]).expect("send succeeds");
        }
    });

    // The sender should stall once it has 2 unacknowledged packets
    // outstanding (send_buffer_size == 2); give it a moment to hit that
    // wall before the receiver starts draining.
    thread::sleep(Duration::from_millis(50));

    for i in 0..10u8 {
        let got = slave.receive_packet(pipe).expect("receive succeeds");
        assert_eq!(got, vec![i]);
    }

    sender.join().expect("sender thread completes");
}

#[test]
fn close_pipe_is_not_idempotent_on_the_same_node() {
    let (master, slave) = spawn_connected_pair(50);
    let pipe = master.open_pipe().expect("master opens pipe");
    slave.open_pipe().expect("slave opens pipe");

    let slave_thread = thread::spawn(move || slave.close_pipe(pipe));
    master.close_pipe(pipe).expect("master closes pipe");
    slave_thread
        .join()
        .expect("slave thread completes")
        .expect("slave closes pipe");

    assert!(master.close_pipe(pipe).is_err());
}
