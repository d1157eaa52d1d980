//! Entity (typed message) pipe primitive.
//!
//! Mirrors the byte pipe contract with credit counted in entities instead of
//! bytes. Entity endpoints are reactor-local; cross-thread feeding goes
//! through the byte layer (see `pipe::WriterHandle`).

use crate::io::{advance_lim, headroom, notify_best_effort, ControlMsg, Credit, EndpointId, Role};
use crate::reactor::Scheduler;
use quark::logging;
use quark::{IoError, IoResult};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

/// Receives entities pushed by an attached producer.
///
/// All methods must be invoked on the owning reactor thread.
pub trait EntityConsumer<E> {
    /// Push entities to the consumer. The consumer drains the entities it
    /// accepts from the front of `entities` (bounded by its advertised
    /// credit) and returns its new cumulative limit.
    fn consume(&self, entities: &mut VecDeque<E>) -> IoResult<Credit>;

    /// Signals end-of-data; no further `consume` calls are accepted.
    fn end_consume(&self, clean: bool);

    fn abort(&self);

    /// Attach a producer, issuing the reciprocal attach on it.
    fn attach(&self, producer: &EntityProducerRef<E>) -> IoResult<()>;

    fn detach(&self);

    fn control(&self, _msg: &ControlMsg) -> IoResult<()> {
        Err(IoError::MissingControl)
    }

    fn endpoint_id(&self) -> EndpointId;
}

/// Pushes entities to an attached consumer, honoring its credit.
pub trait EntityProducer<E> {
    /// Updates the cumulative limit of entities the attached consumer
    /// accepts. Must not call `consume` synchronously.
    fn can_produce(&self, limit: Credit);

    fn abort(&self);

    /// Attach a consumer, issuing the reciprocal attach on it.
    fn attach(&self, consumer: &EntityConsumerRef<E>) -> IoResult<()>;

    fn detach(&self);

    fn control(&self, _msg: &ControlMsg) -> IoResult<()> {
        Err(IoError::MissingControl)
    }

    fn endpoint_id(&self) -> EndpointId;
}

pub type EntityConsumerRef<E> = Rc<dyn EntityConsumer<E>>;
pub type EntityProducerRef<E> = Rc<dyn EntityProducer<E>>;

/// A consumer/producer pair making up one end of a duplex entity channel.
pub struct EntityIoPair<E> {
    pub consumer: EntityConsumerRef<E>,
    pub producer: EntityProducerRef<E>,
}

impl<E> EntityIoPair<E> {
    pub fn new(consumer: EntityConsumerRef<E>, producer: EntityProducerRef<E>) -> EntityIoPair<E> {
        EntityIoPair { consumer, producer }
    }

    /// Cross-attaches two pairs.
    pub fn attach(&self, other: &EntityIoPair<E>) -> IoResult<()> {
        self.consumer.attach(&other.producer)?;
        self.producer.attach(&other.consumer)
    }

    pub fn abort(&self) {
        self.consumer.abort();
        self.producer.abort();
    }
}

// =============================================================== EntitySink

struct EntitySinkState<E> {
    producer: Option<EntityProducerRef<E>>,
    queue: VecDeque<E>,
    consumed: u64,
    lim_sent: Credit,
    eod: Option<bool>,
    aborted: bool,
}

struct EntitySinkCore<E> {
    capacity: usize,
    state: RefCell<EntitySinkState<E>>,
    log: logging::Logger,
}

/// Leaf entity consumer buffering received entities for local draining.
pub struct EntitySink<E> {
    core: Rc<EntitySinkCore<E>>,
}

impl<E: 'static> EntitySink<E> {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        capacity: usize,
        log: L,
    ) -> EntitySink<E> {
        EntitySink {
            core: Rc::new(EntitySinkCore {
                capacity,
                state: RefCell::new(EntitySinkState {
                    producer: None,
                    queue: VecDeque::new(),
                    consumed: 0,
                    lim_sent: 0,
                    eod: None,
                    aborted: false,
                }),
                log: logging::child_or_discard(log),
            }),
        }
    }

    pub fn entity_consume(&self) -> EntityConsumerRef<E> {
        Rc::new(EntitySinkFacade {
            core: self.core.clone(),
        })
    }

    /// Removes the next buffered entity, re-advertising freed credit.
    pub fn pop(&self) -> Option<E> {
        let (entity, producer, lim) = {
            let mut state = self.core.state.borrow_mut();
            let entity = state.queue.pop_front()?;
            let free = self.core.capacity.saturating_sub(state.queue.len());
            let lim = state.consumed as Credit + free as Credit;
            let producer = match lim > state.lim_sent && state.eod.is_none() {
                true => {
                    state.lim_sent = lim;
                    state.producer.clone()
                }
                false => None,
            };
            (entity, producer, lim)
        };

        if let Some(producer) = producer {
            producer.can_produce(lim);
        }
        Some(entity)
    }

    pub fn len(&self) -> usize {
        self.core.state.borrow().queue.len()
    }

    /// End-of-data marker: `None` while open, otherwise the clean flag.
    pub fn ended(&self) -> Option<bool> {
        self.core.state.borrow().eod
    }

    pub fn abort(&self) {
        EntitySinkCore::abort(&self.core);
    }
}

impl<E: 'static> EntitySinkCore<E> {
    fn consume(core: &Rc<Self>, entities: &mut VecDeque<E>) -> IoResult<Credit> {
        let mut state = core.state.borrow_mut();
        if state.eod.is_some() {
            return Err(IoError::Closed);
        }
        if state.producer.is_none() {
            return Err(IoError::Contract("no attached producer"));
        }
        if entities.is_empty() {
            return Err(IoError::Contract("no entities to consume"));
        }
        let room = headroom(state.consumed, state.lim_sent);
        if room == 0 {
            return Err(IoError::Contract("consume limit exceeded"));
        }

        let mut take = entities.len();
        if room > 0 {
            take = take.min(room as usize);
        }
        for entity in entities.drain(..take) {
            state.queue.push_back(entity);
        }
        state.consumed += take as u64;

        let free = core.capacity.saturating_sub(state.queue.len());
        state.lim_sent = state.consumed as Credit + free as Credit;
        Ok(state.lim_sent)
    }

    fn end_consume(core: &Rc<Self>, clean: bool) {
        let mut state = core.state.borrow_mut();
        if state.eod.is_none() {
            state.eod = Some(clean);
            logging::debug!(core.log, "entity sink end-of-data"; "clean" => clean);
        }
    }

    fn abort(core: &Rc<Self>) {
        let producer = {
            let mut state = core.state.borrow_mut();
            if state.aborted {
                return;
            }
            state.aborted = true;
            if state.eod.is_none() {
                state.eod = Some(false);
            }
            state.queue.clear();
            state.producer.take()
        };
        if let Some(producer) = producer {
            producer.abort();
            producer.detach();
        }
    }

    fn attach(core: &Rc<Self>, producer: &EntityProducerRef<E>) -> IoResult<()> {
        let initial_lim = {
            let mut state = core.state.borrow_mut();
            if let Some(current) = &state.producer {
                if current.endpoint_id() == producer.endpoint_id() {
                    return Ok(());
                }
                return Err(IoError::Contract("producer already attached"));
            }
            if state.eod.is_some() {
                return Err(IoError::Closed);
            }
            state.producer = Some(producer.clone());
            state.consumed = 0;
            state.lim_sent = core.capacity.saturating_sub(state.queue.len()) as Credit;
            state.lim_sent
        };

        producer.attach(&(Rc::new(EntitySinkFacade { core: core.clone() }) as EntityConsumerRef<E>))?;
        producer.can_produce(initial_lim);
        notify_best_effort(|| producer.control(&ControlMsg::NotifyConsumerAttached));
        Ok(())
    }

    fn detach(core: &Rc<Self>) {
        let producer = {
            let mut state = core.state.borrow_mut();
            match state.producer.take() {
                Some(producer) => {
                    state.consumed = 0;
                    state.lim_sent = 0;
                    producer
                }
                None => return,
            }
        };
        producer.detach();
    }
}

struct EntitySinkFacade<E> {
    core: Rc<EntitySinkCore<E>>,
}

impl<E: 'static> EntityConsumer<E> for EntitySinkFacade<E> {
    fn consume(&self, entities: &mut VecDeque<E>) -> IoResult<Credit> {
        EntitySinkCore::consume(&self.core, entities)
    }

    fn end_consume(&self, clean: bool) {
        EntitySinkCore::end_consume(&self.core, clean)
    }

    fn abort(&self) {
        EntitySinkCore::abort(&self.core)
    }

    fn attach(&self, producer: &EntityProducerRef<E>) -> IoResult<()> {
        EntitySinkCore::attach(&self.core, producer)
    }

    fn detach(&self) {
        EntitySinkCore::detach(&self.core)
    }

    fn endpoint_id(&self) -> EndpointId {
        EndpointId::new(&self.core, Role::Consumer)
    }
}

// ============================================================= EntityWriter

struct EntityWriterState<E> {
    consumer: Option<EntityConsumerRef<E>>,
    queue: VecDeque<E>,
    produced: u64,
    prod_lim: Credit,
    eod: bool,
    eod_clean: bool,
    sent_eod: bool,
    aborted: bool,
}

struct EntityWriterCore<E> {
    sched: Scheduler,
    state: RefCell<EntityWriterState<E>>,
    log: logging::Logger,
}

/// Leaf entity producer queueing entities written on the reactor thread.
pub struct EntityWriter<E> {
    core: Rc<EntityWriterCore<E>>,
}

impl<E: 'static> EntityWriter<E> {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        sched: &Scheduler,
        log: L,
    ) -> EntityWriter<E> {
        EntityWriter {
            core: Rc::new(EntityWriterCore {
                sched: sched.clone(),
                state: RefCell::new(EntityWriterState {
                    consumer: None,
                    queue: VecDeque::new(),
                    produced: 0,
                    prod_lim: 0,
                    eod: false,
                    eod_clean: true,
                    sent_eod: false,
                    aborted: false,
                }),
                log: logging::child_or_discard(log),
            }),
        }
    }

    pub fn entity_produce(&self) -> EntityProducerRef<E> {
        Rc::new(EntityWriterFacade {
            core: self.core.clone(),
        })
    }

    /// Queues an entity for delivery.
    pub fn write(&self, entity: E) -> IoResult<()> {
        {
            let mut state = self.core.state.borrow_mut();
            if state.eod {
                return Err(IoError::Closed);
            }
            state.queue.push_back(entity);
        }
        let core = self.core.clone();
        self.core.sched.defer(move || EntityWriterCore::do_produce(&core));
        Ok(())
    }

    /// Marks end-of-data; queued entities are still delivered first.
    pub fn end_write(&self, clean: bool) {
        {
            let mut state = self.core.state.borrow_mut();
            if state.eod {
                return;
            }
            state.eod = true;
            state.eod_clean = clean;
        }
        let core = self.core.clone();
        self.core.sched.defer(move || EntityWriterCore::do_produce(&core));
    }

    pub fn abort(&self) {
        EntityWriterCore::abort(&self.core);
    }
}

impl<E: 'static> EntityWriterCore<E> {
    fn do_produce(core: &Rc<Self>) {
        loop {
            let (consumer, mut batch, eod, eod_clean) = {
                let mut state = core.state.borrow_mut();
                if state.aborted || state.sent_eod {
                    return;
                }
                let consumer = match &state.consumer {
                    Some(consumer) => consumer.clone(),
                    None => return,
                };

                let room = headroom(state.produced, state.prod_lim);
                if room == 0 {
                    return;
                }
                let take = match room {
                    r if r < 0 => state.queue.len(),
                    r => state.queue.len().min(r as usize),
                };
                let batch: VecDeque<E> = state.queue.drain(..take).collect();
                (consumer, batch, state.eod, state.eod_clean)
            };

            if batch.is_empty() {
                if eod {
                    let notify = {
                        let mut state = core.state.borrow_mut();
                        if state.sent_eod {
                            false
                        } else {
                            state.sent_eod = true;
                            true
                        }
                    };
                    if notify {
                        consumer.end_consume(eod_clean);
                    }
                }
                return;
            }

            let sent = batch.len();
            let result = consumer.consume(&mut batch);

            let leftover = batch.len();
            let accepted = sent - leftover;
            if leftover > 0 {
                let mut state = core.state.borrow_mut();
                for entity in batch.into_iter().rev() {
                    state.queue.push_front(entity);
                }
            }

            match result {
                Ok(new_lim) => {
                    let blocked = {
                        let mut state = core.state.borrow_mut();
                        state.produced += accepted as u64;
                        state.prod_lim = new_lim;
                        headroom(state.produced, state.prod_lim) == 0
                    };
                    if blocked || accepted == 0 {
                        return;
                    }
                }
                Err(IoError::Wait) | Err(IoError::MissingControl) => return,
                Err(err) => {
                    logging::debug!(core.log, "entity writer consume failed"; "err" => ?err);
                    Self::abort(core);
                    return;
                }
            }
        }
    }

    fn can_produce(core: &Rc<Self>, limit: Credit) {
        let grew = {
            let mut state = core.state.borrow_mut();
            if state.consumer.is_none() {
                return;
            }
            advance_lim(&mut state.prod_lim, limit)
        };
        if grew {
            let core = core.clone();
            core.sched.clone().defer(move || Self::do_produce(&core));
        }
    }

    fn abort(core: &Rc<Self>) {
        let consumer = {
            let mut state = core.state.borrow_mut();
            if state.aborted {
                return;
            }
            state.aborted = true;
            state.eod = true;
            state.queue.clear();
            state.produced = 0;
            state.prod_lim = 0;
            state.consumer.take()
        };
        if let Some(consumer) = consumer {
            consumer.abort();
            consumer.detach();
        }
    }

    fn attach(core: &Rc<Self>, consumer: &EntityConsumerRef<E>) -> IoResult<()> {
        {
            let mut state = core.state.borrow_mut();
            if let Some(current) = &state.consumer {
                if current.endpoint_id() == consumer.endpoint_id() {
                    return Ok(());
                }
                return Err(IoError::Contract("consumer already attached"));
            }
            if state.sent_eod {
                return Err(IoError::Closed);
            }
            state.consumer = Some(consumer.clone());
            state.produced = 0;
            state.prod_lim = 0;
        }

        consumer.attach(&(Rc::new(EntityWriterFacade { core: core.clone() }) as EntityProducerRef<E>))?;
        notify_best_effort(|| consumer.control(&ControlMsg::NotifyProducerAttached));
        Ok(())
    }

    fn detach(core: &Rc<Self>) {
        let consumer = {
            let mut state = core.state.borrow_mut();
            match state.consumer.take() {
                Some(consumer) => {
                    state.produced = 0;
                    state.prod_lim = 0;
                    consumer
                }
                None => return,
            }
        };
        consumer.detach();
    }
}

struct EntityWriterFacade<E> {
    core: Rc<EntityWriterCore<E>>,
}

impl<E: 'static> EntityProducer<E> for EntityWriterFacade<E> {
    fn can_produce(&self, limit: Credit) {
        EntityWriterCore::can_produce(&self.core, limit)
    }

    fn abort(&self) {
        EntityWriterCore::abort(&self.core)
    }

    fn attach(&self, consumer: &EntityConsumerRef<E>) -> IoResult<()> {
        EntityWriterCore::attach(&self.core, consumer)
    }

    fn detach(&self) {
        EntityWriterCore::detach(&self.core)
    }

    fn endpoint_id(&self) -> EndpointId {
        EndpointId::new(&self.core, Role::Producer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::Reactor;
    use std::time::Duration;

    #[test]
    fn test_writer_to_sink_delivery() {
        let mut reactor = Reactor::new(None).unwrap();
        let sched = reactor.scheduler();

        let sink: EntitySink<u64> = EntitySink::new(8, None);
        let writer: EntityWriter<u64> = EntityWriter::new(&sched, None);
        writer.entity_produce().attach(&sink.entity_consume()).unwrap();

        for value in 0..5u64 {
            writer.write(value).unwrap();
        }
        writer.end_write(true);

        assert!(reactor.run_until(Duration::from_secs(2), || sink.ended() == Some(true)));
        let drained: Vec<u64> = std::iter::from_fn(|| sink.pop()).collect();
        assert_eq!(drained, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_bounded_sink_backpressure() {
        let mut reactor = Reactor::new(None).unwrap();
        let sched = reactor.scheduler();

        let sink: EntitySink<u64> = EntitySink::new(2, None);
        let writer: EntityWriter<u64> = EntityWriter::new(&sched, None);
        writer.entity_produce().attach(&sink.entity_consume()).unwrap();

        for value in 0..6u64 {
            writer.write(value).unwrap();
        }

        assert!(reactor.run_until(Duration::from_secs(2), || sink.len() == 2));
        assert_eq!(sink.pop(), Some(0));
        assert_eq!(sink.pop(), Some(1));

        assert!(reactor.run_until(Duration::from_secs(2), || sink.len() == 2));
        assert_eq!(sink.pop(), Some(2));
        assert_eq!(sink.pop(), Some(3));

        assert!(reactor.run_until(Duration::from_secs(2), || sink.len() == 2));
        assert_eq!(sink.pop(), Some(4));
        assert_eq!(sink.pop(), Some(5));
        assert_eq!(sink.pop(), None);
    }

    #[test]
    fn test_entity_credit_counts_entities() {
        let reactor = Reactor::new(None).unwrap();
        let sched = reactor.scheduler();

        let sink: EntitySink<String> = EntitySink::new(3, None);
        let writer: EntityWriter<String> = EntityWriter::new(&sched, None);
        writer.entity_produce().attach(&sink.entity_consume()).unwrap();

        let consumer = sink.entity_consume();
        let mut batch: VecDeque<String> =
            vec!["a".into(), "b".into(), "c".into(), "d".into()].into();
        let lim = consumer.consume(&mut batch).unwrap();

        // Only three entities fit; the fourth stays with the producer
        assert_eq!(batch.len(), 1);
        assert_eq!(lim, 3);

        drop(reactor);
    }

    #[test]
    fn test_abort_propagates_to_writer() {
        let mut reactor = Reactor::new(None).unwrap();
        let sched = reactor.scheduler();

        let sink: EntitySink<u64> = EntitySink::new(4, None);
        let writer: EntityWriter<u64> = EntityWriter::new(&sched, None);
        writer.entity_produce().attach(&sink.entity_consume()).unwrap();

        sink.abort();
        assert_eq!(writer.write(1).unwrap_err(), IoError::Closed);

        drop(reactor);
    }
}
