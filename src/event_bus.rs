/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The event bus: a thread that takes events published by the engine and calls the registered
//! handlers on each.

use std::sync::mpsc::{Receiver, TryRecvError};
use std::thread::{self, JoinHandle};

use crate::events::Event;
use crate::logging;

/// The closures called on each published [`Event`], in registration order.
pub struct EventHandlers {
    handlers: Vec<Box<dyn Fn(&Event) + Send>>,
}

impl EventHandlers {
    /// Create an empty set of handlers.
    pub fn new() -> EventHandlers {
        EventHandlers {
            handlers: Vec::new(),
        }
    }

    /// Create a set of handlers containing only the [default CSV logger](logging::log_event).
    pub fn with_default_logging() -> EventHandlers {
        let mut handlers = EventHandlers::new();
        handlers.add(logging::log_event);
        handlers
    }

    /// Register `handler` to be called on every event.
    pub fn add(&mut self, handler: impl Fn(&Event) + Send + 'static) {
        self.handlers.push(Box::new(handler));
    }

    fn handle(&self, event: &Event) {
        for handler in &self.handlers {
            handler(event);
        }
    }
}

impl Default for EventHandlers {
    fn default() -> EventHandlers {
        EventHandlers::new()
    }
}

/// Start the event bus thread.
///
/// The thread drains `events` and calls `handlers` on each, until `shutdown_signal` fires or the
/// engine's event publisher is dropped.
pub fn start_event_bus(
    events: Receiver<Event>,
    handlers: EventHandlers,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) => return,
            Err(TryRecvError::Empty) => {}
            Err(TryRecvError::Disconnected) => return,
        }

        match events.try_recv() {
            Ok(event) => handlers.handle(&event),
            Err(TryRecvError::Empty) => thread::yield_now(),
            Err(TryRecvError::Disconnected) => return,
        }
    })
}
