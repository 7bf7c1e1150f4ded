#![cfg(windows)]

use std::{
    io::Write as _,
    net,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use portico_driver::{
    immediate, is_supported,
    op::{
        Accept, ChildExit, Fsync, LinkTimeout, NotifyEventSource, PollFd, Read, ReadVectored, Recv,
        RecvMsg, Timeout, WaitEventSource, Write,
    },
    AsRawFd, Completion, CompletionMode, Driver, EventSource, Interest, Op, OpKind, OpOutput,
    Request, Termination,
};

const ERROR_OPERATION_ABORTED: i32 = 995;

fn drive(driver: &mut Driver, want: usize) -> Vec<Completion> {
    let mut out = Vec::new();
    while out.len() < want {
        let summary = driver
            .complete(CompletionMode::Blocking, |c| out.push(c))
            .unwrap();
        assert!(summary.num_completed > 0);
    }
    out
}

fn tcp_pair() -> (net::TcpStream, net::TcpStream) {
    let listener = net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let client = net::TcpStream::connect(addr).unwrap();
    let (server, _) = listener.accept().unwrap();
    (client, server)
}

#[test]
fn poll_is_unsupported() {
    let file = tempfile::tempfile().unwrap();
    let poll = Request::new(Op::Poll(PollFd {
        fd: file.as_raw_fd(),
        interest: Interest::READABLE,
    }));
    let read = Request::new(Op::Read(Read {
        fd: file.as_raw_fd(),
        buffer: vec![0; 16],
        offset: Some(0),
    }));
    assert!(!is_supported([&poll, &read]));
    assert!(is_supported([&read]));

    let mut driver = Driver::new().unwrap();
    driver.queue([poll]).unwrap();
    let done = drive(&mut driver, 1);
    assert_eq!(
        done[0].result.as_ref().unwrap_err().kind(),
        std::io::ErrorKind::Unsupported
    );
}

#[test]
fn read_reports_buffered_bytes() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&[7u8; 42]).unwrap();
    file.flush().unwrap();
    let file = std::fs::File::open(file.path()).unwrap();

    let mut driver = Driver::new().unwrap();
    driver
        .queue([Request::new(Op::Read(Read {
            fd: file.as_raw_fd(),
            buffer: vec![0; 128],
            offset: Some(0),
        }))
        .user_data(1)])
        .unwrap();
    let done = drive(&mut driver, 1);
    assert_eq!(done[0].user_data, 1);
    match done[0].result.as_ref().unwrap() {
        OpOutput::Bytes(n) => assert_eq!(*n, 42),
        other => panic!("unexpected output {other:?}"),
    }
    match &done[0].op {
        Op::Read(read) => assert_eq!(&read.buffer[..42], &[7u8; 42]),
        other => panic!("unexpected op {other:?}"),
    }
}

#[test]
fn write_to_read_only_handle_is_an_orientation_error() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(b"seed").unwrap();
    let read_only = std::fs::File::open(file.path()).unwrap();

    let mut driver = Driver::new().unwrap();
    driver
        .queue([Request::new(Op::Write(Write {
            fd: read_only.as_raw_fd(),
            buffer: b"denied".to_vec(),
            offset: Some(0),
        }))])
        .unwrap();
    let done = drive(&mut driver, 1);
    assert_eq!(
        done[0].result.as_ref().unwrap_err().kind(),
        std::io::ErrorKind::PermissionDenied
    );
}

#[test]
fn write_without_offset_appends() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(b"abc").unwrap();
    file.flush().unwrap();

    let mut driver = Driver::new().unwrap();
    driver
        .queue([Request::new(Op::Write(Write {
            fd: file.as_file().as_raw_fd(),
            buffer: b"xyz".to_vec(),
            offset: None,
        }))])
        .unwrap();
    let done = drive(&mut driver, 1);
    match done[0].result.as_ref().unwrap() {
        OpOutput::Bytes(n) => assert_eq!(*n, 3),
        other => panic!("unexpected output {other:?}"),
    }

    // The sentinel defers position resolution to the kernel, which lands the
    // write at end of file.
    let contents = std::fs::read(file.path()).unwrap();
    assert_eq!(contents, b"abcxyz");
}

#[test]
fn empty_vectored_read_short_circuits() {
    let file = tempfile::tempfile().unwrap();
    let mut driver = Driver::new().unwrap();
    driver
        .queue([Request::new(Op::ReadVectored(ReadVectored {
            fd: file.as_raw_fd(),
            buffers: Vec::new(),
            offset: Some(0),
        }))])
        .unwrap();
    let done = drive(&mut driver, 1);
    match done[0].result.as_ref().unwrap() {
        OpOutput::Bytes(n) => assert_eq!(*n, 0),
        other => panic!("unexpected output {other:?}"),
    }
}

#[test]
fn timeout_and_event_source_finish_in_any_order() {
    let source = Arc::new(EventSource::new());
    let mut driver = Driver::new().unwrap();
    driver
        .queue([
            Request::new(Op::Timeout(Timeout {
                delay: Duration::from_millis(1),
            }))
            .user_data(1),
            Request::new(Op::WaitEventSource(WaitEventSource {
                source: source.clone(),
            }))
            .user_data(2),
        ])
        .unwrap();

    let notifier = {
        let source = source.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            source.notify();
        })
    };
    let done = drive(&mut driver, 2);
    notifier.join().unwrap();

    let mut seen: Vec<usize> = done
        .iter()
        .map(|c| {
            assert!(c.result.is_ok(), "{:?}", c.result);
            c.user_data
        })
        .collect();
    seen.sort_unstable();
    assert_eq!(seen, [1, 2]);
}

#[test]
fn child_exit_reports_the_exit_code() {
    let mut child = std::process::Command::new("cmd")
        .args(["/C", "exit", "7"])
        .spawn()
        .unwrap();

    let mut driver = Driver::new().unwrap();
    driver
        .queue([Request::new(Op::ChildExit(ChildExit {
            child: child.as_raw_fd(),
        }))])
        .unwrap();
    let done = drive(&mut driver, 1);
    match done[0].result.as_ref().unwrap() {
        OpOutput::Term(term) => assert_eq!(*term, Termination::Exited(7)),
        other => panic!("unexpected output {other:?}"),
    }
    child.wait().unwrap();
}

#[test]
fn cancelled_child_exit_reports_the_cancellation() {
    let mut child = std::process::Command::new("cmd")
        .args(["/C", "pause"])
        .stdin(std::process::Stdio::piped())
        .spawn()
        .unwrap();

    let mut driver = Driver::new().unwrap();
    let ids = driver
        .queue([Request::new(Op::ChildExit(ChildExit {
            child: child.as_raw_fd(),
        }))])
        .unwrap();
    // Start the operation, then cancel it while the child still runs.
    driver.complete(CompletionMode::NonBlocking, |_| {}).unwrap();
    assert!(driver.cancel(ids[0]));
    let done = drive(&mut driver, 1);
    assert_eq!(
        done[0].result.as_ref().unwrap_err().raw_os_error(),
        Some(ERROR_OPERATION_ABORTED)
    );

    child.kill().ok();
    child.wait().unwrap();
}

#[test]
fn accept_hands_back_socket_and_peer() {
    let listener = net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let mut driver = Driver::new().unwrap();
    driver
        .queue([Request::new(Op::Accept(Accept {
            fd: listener.as_raw_fd(),
        }))])
        .unwrap();

    let connector = thread::spawn(move || net::TcpStream::connect(addr).unwrap());
    let done = drive(&mut driver, 1);
    let client = connector.join().unwrap();

    match done[0].result.as_ref().unwrap() {
        OpOutput::Accepted { socket, peer } => {
            let peer = peer.as_ref().expect("peer address");
            assert_eq!(
                peer.as_socket().unwrap(),
                client.local_addr().unwrap()
            );
            assert!(socket.peer_addr().is_ok());
        }
        other => panic!("unexpected output {other:?}"),
    }
}

#[test]
fn recv_batch_with_partial_cancellation() {
    const SOCKETS: usize = 8;
    const CANCELLED: [usize; 3] = [0, 3, 7];

    let pairs: Vec<_> = (0..SOCKETS).map(|_| tcp_pair()).collect();
    let mut driver = Driver::new().unwrap();
    let requests: Vec<_> = pairs
        .iter()
        .enumerate()
        .map(|(i, (_, server))| {
            Request::new(Op::Recv(Recv {
                fd: server.as_raw_fd(),
                buffer: vec![0; 64],
            }))
            .user_data(i)
        })
        .collect();
    let ids = driver.queue(requests).unwrap();

    // Submit everything, then cancel a subset mid-flight.
    driver.complete(CompletionMode::NonBlocking, |_| {}).unwrap();
    for &i in &CANCELLED {
        driver.cancel(ids[i]);
    }
    for (i, (client, _)) in pairs.iter().enumerate() {
        if !CANCELLED.contains(&i) {
            (&*client).write_all(b"payload").unwrap();
        }
    }

    let done = drive(&mut driver, SOCKETS);
    assert_eq!(done.len(), SOCKETS);
    for completion in &done {
        if CANCELLED.contains(&completion.user_data) {
            assert_eq!(
                completion.result.as_ref().unwrap_err().raw_os_error(),
                Some(ERROR_OPERATION_ABORTED),
                "socket {} should be cancelled",
                completion.user_data
            );
        } else {
            match completion.result.as_ref().unwrap() {
                OpOutput::Bytes(n) => assert_eq!(*n, b"payload".len()),
                other => panic!("unexpected output {other:?}"),
            }
        }
    }
}

#[test]
fn recv_msg_reports_the_datagram_length() {
    let a = net::UdpSocket::bind("127.0.0.1:0").unwrap();
    let b = net::UdpSocket::bind("127.0.0.1:0").unwrap();
    b.send_to(b"datagram", a.local_addr().unwrap()).unwrap();

    let mut driver = Driver::new().unwrap();
    driver
        .queue([Request::new(Op::RecvMsg(RecvMsg {
            fd: a.as_raw_fd(),
            buffer: vec![0; 64],
        }))])
        .unwrap();
    let done = drive(&mut driver, 1);
    match done[0].result.as_ref().unwrap() {
        OpOutput::Bytes(n) => assert_eq!(*n, b"datagram".len()),
        other => panic!("unexpected output {other:?}"),
    }
}

#[test]
fn link_timeout_cancels_the_linked_receive() {
    let (_client, server) = tcp_pair();
    let mut driver = Driver::new().unwrap();
    driver
        .queue([
            Request::new(Op::Recv(Recv {
                fd: server.as_raw_fd(),
                buffer: vec![0; 64],
            }))
            .user_data(1)
            .link_next(),
            Request::new(Op::LinkTimeout(LinkTimeout {
                delay: Duration::from_millis(10),
            }))
            .user_data(2),
        ])
        .unwrap();
    let done = drive(&mut driver, 2);
    for completion in &done {
        match completion.user_data {
            1 => assert_eq!(
                completion.result.as_ref().unwrap_err().raw_os_error(),
                Some(ERROR_OPERATION_ABORTED)
            ),
            2 => assert!(completion.result.is_ok()),
            other => panic!("unexpected user_data {other}"),
        }
    }
}

#[test]
fn completed_operation_disarms_its_link_timeout() {
    let (client, server) = tcp_pair();
    (&client).write_all(b"early").unwrap();

    let mut driver = Driver::new().unwrap();
    let start = Instant::now();
    driver
        .queue([
            Request::new(Op::Recv(Recv {
                fd: server.as_raw_fd(),
                buffer: vec![0; 64],
            }))
            .user_data(1)
            .link_next(),
            Request::new(Op::LinkTimeout(LinkTimeout {
                delay: Duration::from_secs(30),
            }))
            .user_data(2),
        ])
        .unwrap();
    let done = drive(&mut driver, 2);
    assert!(start.elapsed() < Duration::from_secs(10));
    for completion in &done {
        match completion.user_data {
            1 => match completion.result.as_ref().unwrap() {
                OpOutput::Bytes(n) => assert_eq!(*n, b"early".len()),
                other => panic!("unexpected output {other:?}"),
            },
            2 => assert!(completion.result.is_err()),
            other => panic!("unexpected user_data {other}"),
        }
    }
}

#[test]
fn single_threaded_driver_completes_blocking_ops_inline() {
    let source = Arc::new(EventSource::new());
    let mut driver = Driver::builder().thread_pool_limit(0).build().unwrap();
    driver
        .queue([Request::new(Op::NotifyEventSource(NotifyEventSource {
            source: source.clone(),
        }))])
        .unwrap();
    // A single non-blocking pass must run the operation on this thread.
    let mut completed = 0;
    let summary = driver
        .complete(CompletionMode::NonBlocking, |c| {
            assert_eq!(c.op.kind(), OpKind::NotifyEventSource);
            assert!(c.result.is_ok());
            completed += 1;
        })
        .unwrap();
    assert_eq!(summary.num_completed, 1);
    assert_eq!(completed, 1);
    assert!(source.try_wait());
}

#[test]
fn blocking_ops_ride_the_worker_pool() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(b"sync me").unwrap();

    let mut driver = Driver::new().unwrap();
    driver
        .queue([Request::new(Op::Fsync(Fsync {
            fd: file.as_raw_fd(),
        }))])
        .unwrap();
    let done = drive(&mut driver, 1);
    assert!(done[0].result.is_ok());
}

#[test]
fn destroy_returns_within_the_join_horizon() {
    let files: Vec<_> = (0..8)
        .map(|_| {
            let mut f = tempfile::NamedTempFile::new().unwrap();
            f.write_all(b"data").unwrap();
            f
        })
        .collect();

    let mut driver = Driver::new().unwrap();
    let requests: Vec<_> = files
        .iter()
        .map(|f| {
            Request::new(Op::Fsync(Fsync {
                fd: f.as_raw_fd(),
            }))
        })
        .collect();
    driver.queue(requests).unwrap();
    drive(&mut driver, 8);

    // Workers are idle now; teardown joins them promptly.
    let start = Instant::now();
    drop(driver);
    assert!(start.elapsed() < Duration::from_secs(10));
}

#[test]
fn immediate_drains_everything() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(b"immediate").unwrap();

    let mut completions = Vec::new();
    let errors = immediate(
        [
            Request::new(Op::Fsync(Fsync {
                fd: file.as_raw_fd(),
            }))
            .user_data(1),
            Request::new(Op::Timeout(Timeout {
                delay: Duration::from_millis(1),
            }))
            .user_data(2),
        ],
        |c| completions.push(c),
    )
    .unwrap();
    assert_eq!(errors, 0);
    assert_eq!(completions.len(), 2);
}
