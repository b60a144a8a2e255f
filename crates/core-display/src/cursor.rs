//! Cursor pipeline: the parallel ring beside the display channel.
//!
//! Much smaller than the display path — cursor commands mutate a single
//! current-cursor state, shapes go through a per-client budgeted cache,
//! and the mouse mode decides whether moves are forwarded at all (client
//! mouse mode renders the cursor locally).

use std::collections::VecDeque;

use core_cache::{ChannelAddOutcome, ChannelCache};
use core_dispatch::device::{CursorPayload, CursorShape};
use core_dispatch::dispatcher::MouseMode;
use core_dispatch::{ClientTransport, SendOutcome, WireFrame};
use core_region::Point;
use core_wire::msg::{CursorMsg, CursorShapeWire};

pub struct CursorClient {
    pub id: u32,
    transport: Box<dyn ClientTransport>,
    pub alive: bool,
    pipe: VecDeque<CursorMsg>,
    cache: ChannelCache,
    serial: u64,
    outstanding: u32,
    ack_window: u32,
    blocked: bool,
}

impl CursorClient {
    pub fn new(id: u32, transport: Box<dyn ClientTransport>, cache_budget: u64) -> Self {
        let ack_window = if transport.low_latency() {
            crate::client::ACK_WINDOW_LOW_LATENCY
        } else {
            crate::client::ACK_WINDOW_HIGH_LATENCY
        };
        Self {
            id,
            transport,
            alive: true,
            pipe: VecDeque::new(),
            cache: ChannelCache::new(cache_budget),
            serial: 0,
            outstanding: 0,
            ack_window,
            blocked: false,
        }
    }

    fn enqueue(&mut self, msg: CursorMsg) {
        self.pipe.push_back(msg);
    }

    /// Wire form of a shape, consulting the shape cache.
    fn shape_to_wire(&mut self, shape: &CursorShape) -> CursorShapeWire {
        let cached = shape.id != 0 && self.cache.find(shape.id);
        if cached {
            return CursorShapeWire {
                id: shape.id,
                width: shape.bitmap.width as u16,
                height: shape.bitmap.height as u16,
                hot: shape.hot,
                cache_me: false,
                from_cache: true,
                data: Vec::new(),
            };
        }
        let mut cache_me = false;
        if shape.id != 0 {
            match self.cache.add(shape.id, shape.bitmap.data.len().max(1) as u64) {
                ChannelAddOutcome::Added { evicted } => {
                    cache_me = true;
                    for old in evicted {
                        self.enqueue(CursorMsg::InvalOne { id: old });
                    }
                }
                ChannelAddOutcome::Denied => {}
            }
        }
        CursorShapeWire {
            id: shape.id,
            width: shape.bitmap.width as u16,
            height: shape.bitmap.height as u16,
            hot: shape.hot,
            cache_me,
            from_cache: false,
            data: shape.bitmap.data.clone(),
        }
    }

    pub fn push(&mut self) {
        if !self.alive {
            return;
        }
        if self.blocked {
            if !self.transport.writable() {
                return;
            }
            self.blocked = false;
        }
        while self.alive && !self.blocked && self.outstanding < self.ack_window {
            let Some(msg) = self.pipe.pop_front() else { break };
            self.serial += 1;
            self.outstanding += 1;
            let mut frame = WireFrame::new(msg.msg_type(), msg.marshal());
            frame.serial = self.serial;
            match self.transport.try_send(&frame) {
                SendOutcome::Sent => {}
                SendOutcome::WouldBlock => {
                    // Retry the same message on writable.
                    self.serial -= 1;
                    self.outstanding -= 1;
                    self.pipe.push_front(msg);
                    self.blocked = true;
                }
                SendOutcome::Closed => self.alive = false,
            }
        }
    }

    pub fn read(&mut self) {
        use core_wire::ClientMessage;
        while let Some(msg) = self.transport.poll_recv() {
            match msg {
                ClientMessage::Ack => {
                    self.outstanding = self.outstanding.saturating_sub(self.ack_window);
                }
                ClientMessage::AckSync { .. } => self.outstanding = 0,
                ClientMessage::Disconnecting => self.alive = false,
                _ => {}
            }
        }
    }
}

/// Worker-side cursor channel state.
pub struct CursorChannel {
    clients: Vec<Option<CursorClient>>,
    pub position: Point,
    pub visible: bool,
    pub trail_length: u16,
    pub trail_frequency: u16,
    current_shape: Option<CursorShape>,
    pub mouse_mode: MouseMode,
    cache_budget: u64,
}

impl CursorChannel {
    pub fn new(max_clients: usize, cache_budget: u64) -> Self {
        Self {
            clients: (0..max_clients).map(|_| None).collect(),
            position: Point::new(0, 0),
            visible: false,
            trail_length: 0,
            trail_frequency: 0,
            current_shape: None,
            mouse_mode: MouseMode::default(),
            cache_budget,
        }
    }

    pub fn connect(&mut self, id: u32, transport: Box<dyn ClientTransport>) {
        let mut client = CursorClient::new(id, transport, self.cache_budget);
        let shape = self.current_shape.as_ref().map(|s| {
            let wire = client.shape_to_wire(s);
            wire
        });
        client.enqueue(CursorMsg::Init {
            position: self.position,
            visible: self.visible,
            trail_length: self.trail_length,
            trail_frequency: self.trail_frequency,
            shape,
        });
        self.clients[id as usize] = Some(client);
    }

    pub fn disconnect(&mut self, id: u32) {
        self.clients[id as usize] = None;
    }

    pub fn client(&self, id: u32) -> Option<&CursorClient> {
        self.clients.get(id as usize).and_then(|c| c.as_ref())
    }

    pub fn set_mouse_mode(&mut self, mode: MouseMode) {
        self.mouse_mode = mode;
    }

    /// Apply one cursor-ring command and fan the resulting messages out.
    pub fn process(&mut self, payload: CursorPayload) {
        match payload {
            CursorPayload::Set {
                position,
                visible,
                shape,
            } => {
                self.position = position;
                self.visible = visible;
                self.current_shape = Some(shape.clone());
                for client in self.clients.iter_mut().flatten() {
                    let wire = client.shape_to_wire(&shape);
                    client.enqueue(CursorMsg::Set {
                        position,
                        visible,
                        shape: wire,
                    });
                }
            }
            CursorPayload::Move { position } => {
                self.position = position;
                if self.mouse_mode == MouseMode::Client {
                    // The client renders its own pointer; moves are noise.
                    return;
                }
                for client in self.clients.iter_mut().flatten() {
                    client.enqueue(CursorMsg::Move { position });
                }
            }
            CursorPayload::Hide => {
                self.visible = false;
                for client in self.clients.iter_mut().flatten() {
                    client.enqueue(CursorMsg::Hide);
                }
            }
            CursorPayload::Trail { length, frequency } => {
                self.trail_length = length;
                self.trail_frequency = frequency;
                for client in self.clients.iter_mut().flatten() {
                    client.enqueue(CursorMsg::Trail { length, frequency });
                }
            }
        }
    }

    /// Reset: drop shape state and invalidate client caches.
    pub fn reset(&mut self) {
        self.current_shape = None;
        self.visible = false;
        for client in self.clients.iter_mut().flatten() {
            client.cache.reset();
            client.enqueue(CursorMsg::Reset);
            client.enqueue(CursorMsg::InvalAll);
        }
    }

    pub fn push_all(&mut self) {
        for client in self.clients.iter_mut().flatten() {
            client.push();
        }
        for slot in &mut self.clients {
            if slot.as_ref().is_some_and(|c| !c.alive) {
                *slot = None;
            }
        }
    }

    pub fn read_all(&mut self) {
        for client in self.clients.iter_mut().flatten() {
            client.read();
        }
    }
}
