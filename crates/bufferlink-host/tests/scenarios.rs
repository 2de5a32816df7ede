//! End-to-end buffer lifecycle between a renderer host and a producer.
//!
//! The host runs on its own thread (the pool handshake blocks the producer
//! until the host answers); the test thread drives the producer and inspects
//! the host through closures executed on the host thread.

use std::cell::Cell;
use std::os::fd::OwnedFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bufferlink_client::{MemfdAllocator, RendererBackend, TargetId, TargetListener};
use bufferlink_host::{Buffer, Presentation, RendererHost, SurfaceId};
use bufferlink_ipc::{BufferId, PoolId, SyncFence};

const WAIT: Duration = Duration::from_secs(5);
const TICK: Duration = Duration::from_millis(5);

type Command = Box<dyn FnOnce(&mut RendererHost) + Send>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    Ready {
        pool_id: PoolId,
        buffer_id: BufferId,
        fenced: bool,
    },
    Displayed(PoolId),
}

#[derive(Clone, Default)]
struct Recorder(Arc<Mutex<Vec<Event>>>);

impl Recorder {
    fn events(&self) -> Vec<Event> {
        self.0.lock().unwrap().clone()
    }
}

impl Presentation for Recorder {
    fn on_buffer_ready(&mut self, buffer: &Buffer, fence: Option<SyncFence>) {
        self.0.lock().unwrap().push(Event::Ready {
            pool_id: buffer.pool_id(),
            buffer_id: buffer.buffer_id(),
            fenced: fence.is_some(),
        });
    }

    fn on_frame_displayed(&mut self, pool_id: PoolId) {
        self.0.lock().unwrap().push(Event::Displayed(pool_id));
    }
}

struct Harness {
    commands: mpsc::Sender<Command>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    recorder: Recorder,
    surface: SurfaceId,
}

impl Harness {
    /// Start a host with one surface; returns the client and surface descriptors.
    fn spawn() -> (Self, OwnedFd, OwnedFd) {
        let (commands, inbox) = mpsc::channel::<Command>();
        let (setup_tx, setup_rx) = mpsc::channel();
        let stop = Arc::new(AtomicBool::new(false));
        let recorder = Recorder::default();

        let thread_stop = stop.clone();
        let thread_recorder = recorder.clone();
        let thread = thread::spawn(move || {
            let mut host = RendererHost::new().unwrap();
            let surface = host.create_surface(Box::new(thread_recorder)).unwrap();
            let surface_fd = host.release_surface_fd(surface).unwrap();
            let client_fd = host.create_client().unwrap();
            setup_tx.send((surface, client_fd, surface_fd)).unwrap();

            while !thread_stop.load(Ordering::Relaxed) {
                while let Ok(command) = inbox.try_recv() {
                    command(&mut host);
                }
                host.dispatch(Some(TICK)).unwrap();
            }
        });

        let (surface, client_fd, surface_fd) = setup_rx.recv().unwrap();
        let harness = Self {
            commands,
            stop,
            thread: Some(thread),
            recorder,
            surface,
        };
        (harness, client_fd, surface_fd)
    }

    fn call<R: Send + 'static>(
        &self,
        f: impl FnOnce(&mut RendererHost) -> R + Send + 'static,
    ) -> R {
        let (tx, rx) = mpsc::channel();
        self.commands
            .send(Box::new(move |host: &mut RendererHost| {
                let _ = tx.send(f(host));
            }))
            .unwrap();
        rx.recv_timeout(WAIT).unwrap()
    }

    fn wait_host(&self, check: impl Fn(&mut RendererHost) -> bool + Send + Clone + 'static) {
        let deadline = Instant::now() + WAIT;
        while !self.call(check.clone()) {
            assert!(Instant::now() < deadline, "host never reached the expected state");
            thread::sleep(TICK);
        }
    }

    fn wait_events(&self, count: usize) -> Vec<Event> {
        let deadline = Instant::now() + WAIT;
        loop {
            let events = self.recorder.events();
            if events.len() >= count {
                return events;
            }
            assert!(Instant::now() < deadline, "presentation saw {:?}", events);
            thread::sleep(TICK);
        }
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

struct Displayed(Rc<Cell<u32>>);

impl TargetListener for Displayed {
    fn frame_displayed(&mut self) {
        self.0.set(self.0.get() + 1);
    }
}

fn producer(client_fd: OwnedFd, surface_fd: OwnedFd) -> (RendererBackend, TargetId, Rc<Cell<u32>>) {
    let mut backend = RendererBackend::new(client_fd, Box::new(MemfdAllocator::new())).unwrap();
    let displayed = Rc::new(Cell::new(0));
    let target = backend
        .create_target(surface_fd, Box::new(Displayed(displayed.clone())))
        .unwrap();
    backend.initialize_target(target, 64, 64).unwrap();
    (backend, target, displayed)
}

fn wait_backend(backend: &mut RendererBackend, mut check: impl FnMut(&RendererBackend) -> bool) {
    let deadline = Instant::now() + WAIT;
    while !check(backend) {
        assert!(Instant::now() < deadline, "producer never reached the expected state");
        backend.dispatch(Some(TICK)).unwrap();
    }
}

fn render(backend: &mut RendererBackend, target: TargetId) {
    backend.frame_will_render(target).unwrap();
    backend.frame_rendered(target, None).unwrap();
}

fn slot_locked_on_host(pool_id: PoolId, buffer_id: BufferId) -> impl Fn(&mut RendererHost) -> bool + Send + Clone + 'static {
    move |host: &mut RendererHost| {
        host.registry()
            .buffer_pool(pool_id)
            .and_then(|pool| pool.get_buffer(buffer_id))
            .is_some_and(|buffer| buffer.is_locked())
    }
}

#[test]
fn test_handshake_registers_pool_with_surface() {
    let (harness, client_fd, surface_fd) = Harness::spawn();
    let (mut backend, target, _) = producer(client_fd, surface_fd);

    backend.frame_will_render(target).unwrap();
    assert_eq!(backend.target(target).unwrap().pool_id(), Some(0));

    let surface = harness.surface;
    harness.wait_host(move |host| host.registry().find_target(0) == Some(surface));
    assert_eq!(harness.call(|host| host.registry().find_target(1)), None);
    assert_eq!(
        harness.call(move |host| host.surface(surface).unwrap().pools().to_vec()),
        vec![0]
    );
}

#[test]
fn test_commit_reaches_presentation_and_locks_slot() {
    let (harness, client_fd, surface_fd) = Harness::spawn();
    let (mut backend, target, _) = producer(client_fd, surface_fd);

    // Slots 0 and 1 stay presented, so the third frame lands in slot 2.
    render(&mut backend, target);
    render(&mut backend, target);
    render(&mut backend, target);

    let events = harness.wait_events(3);
    assert_eq!(
        events[2],
        Event::Ready {
            pool_id: 0,
            buffer_id: 2,
            fenced: false
        }
    );
    harness.wait_host(slot_locked_on_host(0, 2));
    assert!(backend.target(target).unwrap().slot(2).unwrap().is_locked());
}

#[test]
fn test_release_unlocks_producer_slot() {
    let (harness, client_fd, surface_fd) = Harness::spawn();
    let (mut backend, target, _) = producer(client_fd, surface_fd);

    render(&mut backend, target);
    render(&mut backend, target);
    render(&mut backend, target);
    harness.wait_host(slot_locked_on_host(0, 2));

    harness.call(|host| host.release_buffer(0, 2));
    wait_backend(&mut backend, |backend| {
        !backend.target(target).unwrap().slot(2).unwrap().is_locked()
    });
    assert!(backend.target(target).unwrap().slot(1).unwrap().is_locked());

    // The released slot is the first free one again.
    backend.frame_will_render(target).unwrap();
    assert_eq!(
        backend.target(target).unwrap().current().unwrap().buffer_id(),
        2
    );
}

#[test]
fn test_purge_defers_presented_buffer_until_release() {
    let (harness, client_fd, surface_fd) = Harness::spawn();
    let (mut backend, target, _) = producer(client_fd, surface_fd);

    render(&mut backend, target);
    render(&mut backend, target);
    render(&mut backend, target);
    harness.wait_host(slot_locked_on_host(0, 2));

    // Resizing abandons pool 0 while the host still presents its buffers.
    backend.resize(target, 128, 128).unwrap();
    harness.wait_host(|host| host.registry().buffer_pool(0).is_none());
    assert_eq!(harness.call(|host| host.registry().retired_count()), 1);

    harness.call(|host| host.release_buffer(0, 2));
    harness.call(|host| host.release_buffer(0, 1));
    harness.call(|host| host.release_buffer(0, 0));
    assert_eq!(harness.call(|host| host.registry().retired_count()), 0);

    // The next frame negotiates a new pool and starts again at slot 0.
    backend.frame_will_render(target).unwrap();
    let target_state = backend.target(target).unwrap();
    assert_eq!(target_state.pool_id(), Some(1));
    assert_eq!(target_state.current().unwrap().buffer_id(), 0);
    assert!(target_state.slots().iter().all(|slot| !slot.is_locked()));
}

#[test]
fn test_commit_without_surface_is_dropped() {
    let (harness, client_fd, surface_fd) = Harness::spawn();
    let (mut backend, target, _) = producer(client_fd, surface_fd);

    backend.frame_will_render(target).unwrap();
    let surface = harness.surface;
    harness.wait_host(move |host| host.registry().find_target(0) == Some(surface));
    harness.wait_host(|host| {
        host.registry()
            .buffer_pool(0)
            .is_some_and(|pool| pool.get_buffer(0).is_some())
    });

    harness.call(move |host| host.destroy_surface(surface));
    backend.frame_rendered(target, None).unwrap();

    harness.wait_host(|host| {
        host.registry()
            .buffer_pool(0)
            .is_some_and(|pool| pool.get_buffer(0).is_none())
    });
    assert!(harness.recorder.events().is_empty());
}

#[test]
fn test_frame_complete_reaches_listener() {
    let (harness, client_fd, surface_fd) = Harness::spawn();
    let (mut backend, target, displayed) = producer(client_fd, surface_fd);

    render(&mut backend, target);
    harness.wait_events(1);
    let surface = harness.surface;
    harness.call(move |host| host.frame_displayed(surface, 0));

    wait_backend(&mut backend, |_| displayed.get() == 1);
    assert_eq!(harness.recorder.events().last(), Some(&Event::Displayed(0)));
}

#[test]
fn test_fence_travels_with_commit() {
    let (harness, client_fd, surface_fd) = Harness::spawn();
    let (mut backend, target, _) = producer(client_fd, surface_fd);

    let (fence, _signal) = std::os::unix::net::UnixStream::pair().unwrap();
    backend.frame_will_render(target).unwrap();
    backend
        .frame_rendered(target, Some(SyncFence::from_fd(fence.into())))
        .unwrap();

    let events = harness.wait_events(1);
    assert_eq!(
        events[0],
        Event::Ready {
            pool_id: 0,
            buffer_id: 0,
            fenced: true
        }
    );
}

#[test]
fn test_client_disconnect_destroys_its_pools() {
    let (harness, client_fd, surface_fd) = Harness::spawn();
    let (mut backend, target, _) = producer(client_fd, surface_fd);

    backend.frame_will_render(target).unwrap();
    harness.wait_host(|host| host.registry().buffer_pool(0).is_some());

    drop(backend);
    harness.wait_host(|host| host.client_count() == 0);
    assert_eq!(harness.call(|host| host.registry().pool_count()), 0);
    assert_eq!(harness.call(|host| host.registry().find_target(0)), None);
}

#[test]
fn test_commit_right_after_handshake_is_presented() {
    let (harness, client_fd, surface_fd) = Harness::spawn();
    let (mut backend, target, _) = producer(client_fd, surface_fd);

    // Every resize negotiates a new pool; the first commit into each races
    // its registration on the surface socket.
    for round in 0..8u32 {
        backend.resize(target, 64 + round, 64).unwrap();
        render(&mut backend, target);

        let events = harness.wait_events(round as usize + 1);
        assert_eq!(
            events[round as usize],
            Event::Ready {
                pool_id: round,
                buffer_id: 0,
                fenced: false
            }
        );
    }
}
