//! Object-protocol handshake bridge.
//!
//! Negotiates the byte carrier for a link channel. The client advertises its
//! enabled transports (`VTS`, `TLS`, `PLAIN`), the server picks one by fixed
//! preference and replies; the bridge then splices the negotiated transport
//! between its external side (toward the wire) and the retained channel byte
//! pair. All bytes exchanged during the handshake are folded into the credit
//! relayed across the splice, so cumulative limits stay consistent
//! end-to-end.
//!
//! Handshake lines are ASCII, newline terminated and bounded to 64 bytes in
//! both directions.

use crate::io::{
    headroom, notify_best_effort, Buffer, ByteConsumer, ByteConsumerRef, ByteIoPair, ByteProducer,
    ByteProducerRef, ControlMsg, Credit, EndpointId, Role,
};
use crate::reactor::Scheduler;
use quark::logging;
use quark::{IoError, IoResult};
use std::cell::RefCell;
use std::rc::Rc;

const HSHAKE_MAXLEN: usize = 64;

const CLIENT_HELLO_PREFIX: &[u8] = b"VOP_DRAFT-0.8 TRANSPORTS";
const SERVER_HELLO_PREFIX: &[u8] = b"VOP_DRAFT-0.8 USE_TRANSPORT:";

/// Byte transports negotiable by the bridge, in server preference order.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TransportTag {
    Vts,
    Tls,
    Plain,
}

impl TransportTag {
    fn as_bytes(self) -> &'static [u8] {
        match self {
            TransportTag::Vts => b"VTS",
            TransportTag::Tls => b"TLS",
            TransportTag::Plain => b"PLAIN",
        }
    }

    fn parse(tag: &[u8]) -> Option<TransportTag> {
        match tag {
            b"VTS" => Some(TransportTag::Vts),
            b"TLS" => Some(TransportTag::Tls),
            b"PLAIN" => Some(TransportTag::Plain),
            _ => None,
        }
    }
}

/// Endpoints produced by a secure transport factory: the `ext` pair faces
/// the wire, the `int` pair carries the plaintext channel data.
pub struct SecureEndpoints {
    pub ext_consumer: ByteConsumerRef,
    pub ext_producer: ByteProducerRef,
    pub int_consumer: ByteConsumerRef,
    pub int_producer: ByteProducerRef,
}

/// Builds a secure byte transport on demand. Dropped as soon as the
/// handshake settles on a transport, releasing any held credentials.
pub type SecureFactory = Box<dyn Fn(&Scheduler) -> IoResult<SecureEndpoints>>;

enum RoleState {
    Client {
        sent_hello: bool,
    },
    Server {
        have_hello: bool,
        negotiated: Option<TransportTag>,
    },
}

struct VopState {
    handshaking: bool,
    handshake_error: bool,
    handshake_consumed: u64,
    handshake_produced: u64,
    /// Outgoing hello, then incoming hello collection buffer.
    buf: Buffer,
    role: RoleState,

    vec_consumer: Option<ByteConsumerRef>,
    vec_producer: Option<ByteProducerRef>,
    vts_factory: Option<SecureFactory>,
    tls_factory: Option<SecureFactory>,
    allow_insecure: bool,

    // Internal side: the negotiated carrier's endpoints attach here
    tc_producer: Option<ByteProducerRef>,
    tc_cons_lim: Credit,
    tp_consumer: Option<ByteConsumerRef>,
    tp_prod_lim: Credit,

    // External side: the wire transport attaches here
    ec_producer: Option<ByteProducerRef>,
    ec_cons_lim: Credit,
    ep_consumer: Option<ByteConsumerRef>,
    ep_prod_lim: Credit,
}

struct VopCore {
    sched: Scheduler,
    state: RefCell<VopState>,
    log: logging::Logger,
}

/// Client or server side of the object-protocol handshake.
pub struct VopBridge {
    core: Rc<VopCore>,
}

impl Clone for VopBridge {
    fn clone(&self) -> Self {
        VopBridge {
            core: self.core.clone(),
        }
    }
}

impl VopBridge {
    /// Creates the client side of the bridge. `vec` is the channel byte pair
    /// spliced to the negotiated transport after the handshake.
    pub fn client<'a, L: Into<Option<&'a logging::Logger>>>(
        sched: &Scheduler,
        vec: ByteIoPair,
        vts: Option<SecureFactory>,
        tls: Option<SecureFactory>,
        insecure: bool,
        log: L,
    ) -> IoResult<VopBridge> {
        let mut hello = Vec::new();
        hello.extend_from_slice(CLIENT_HELLO_PREFIX);
        if vts.is_some() {
            hello.extend_from_slice(b":VTS");
        }
        if tls.is_some() {
            hello.extend_from_slice(b":TLS");
        }
        if insecure {
            hello.extend_from_slice(b":PLAIN");
        }
        hello.push(b'\n');

        let mut buf = Buffer::new(HSHAKE_MAXLEN);
        buf.append(&hello);

        Self::new(sched, vec, vts, tls, insecure, RoleState::Client { sent_hello: false }, buf, log)
    }

    /// Creates the server side of the bridge.
    pub fn server<'a, L: Into<Option<&'a logging::Logger>>>(
        sched: &Scheduler,
        vec: ByteIoPair,
        vts: Option<SecureFactory>,
        tls: Option<SecureFactory>,
        insecure: bool,
        log: L,
    ) -> IoResult<VopBridge> {
        Self::new(
            sched,
            vec,
            vts,
            tls,
            insecure,
            RoleState::Server {
                have_hello: false,
                negotiated: None,
            },
            Buffer::new(HSHAKE_MAXLEN),
            log,
        )
    }

    fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        sched: &Scheduler,
        vec: ByteIoPair,
        vts: Option<SecureFactory>,
        tls: Option<SecureFactory>,
        insecure: bool,
        role: RoleState,
        buf: Buffer,
        log: L,
    ) -> IoResult<VopBridge> {
        if vts.is_none() && tls.is_none() && !insecure {
            return Err(IoError::Contract("no transports enabled"));
        }

        Ok(VopBridge {
            core: Rc::new(VopCore {
                sched: sched.clone(),
                state: RefCell::new(VopState {
                    handshaking: true,
                    handshake_error: false,
                    handshake_consumed: 0,
                    handshake_produced: 0,
                    buf,
                    role,
                    vec_consumer: Some(vec.consumer),
                    vec_producer: Some(vec.producer),
                    vts_factory: vts,
                    tls_factory: tls,
                    allow_insecure: insecure,
                    tc_producer: None,
                    tc_cons_lim: 0,
                    tp_consumer: None,
                    tp_prod_lim: 0,
                    ec_producer: None,
                    ec_cons_lim: 0,
                    ep_consumer: None,
                    ep_prod_lim: 0,
                }),
                log: logging::child_or_discard(log),
            }),
        })
    }

    pub fn external_consume(&self) -> ByteConsumerRef {
        Rc::new(ExternalConsumerFacade {
            core: self.core.clone(),
        })
    }

    pub fn external_produce(&self) -> ByteProducerRef {
        Rc::new(ExternalProducerFacade {
            core: self.core.clone(),
        })
    }

    /// The wire-facing byte interface of the bridge.
    pub fn external_io(&self) -> ByteIoPair {
        ByteIoPair::new(self.external_consume(), self.external_produce())
    }

    /// True while transport negotiation is incomplete.
    pub fn handshaking(&self) -> bool {
        self.core.state.borrow().handshaking
    }

    /// True if the handshake failed and the bridge aborted.
    pub fn handshake_failed(&self) -> bool {
        self.core.state.borrow().handshake_error
    }

    /// Aborts the bridge and everything spliced through it.
    pub fn abort(&self) {
        let handshaking = self.core.state.borrow().handshaking;
        if handshaking {
            VopCore::handshake_abort(&self.core);
        } else {
            VopCore::ec_abort(&self.core);
            VopCore::ep_abort(&self.core);
        }
    }
}

impl VopCore {
    fn transport_consume_facade(core: &Rc<Self>) -> ByteConsumerRef {
        Rc::new(TransportConsumerFacade { core: core.clone() })
    }

    fn transport_produce_facade(core: &Rc<Self>) -> ByteProducerRef {
        Rc::new(TransportProducerFacade { core: core.clone() })
    }

    // Transport (internal) consumer: outbound bytes from the negotiated
    // carrier, forwarded to the external producer side

    fn tc_consume(core: &Rc<Self>, data: &mut Buffer) -> IoResult<Credit> {
        {
            let state = core.state.borrow();
            if state.tc_producer.is_none() {
                return Err(IoError::Contract("no attached producer"));
            }
            if data.is_empty() {
                return Err(IoError::Contract("no data to consume"));
            }
            if state.handshake_error {
                return Err(IoError::Contract("earlier error during handshaking"));
            }
            if state.handshaking {
                return Err(IoError::Contract("handshake not completed"));
            }
        }

        let consumer = core.state.borrow().ep_consumer.clone();
        let lim = match consumer {
            Some(consumer) => {
                let lim = consumer.consume(data)?;
                let mut state = core.state.borrow_mut();
                state.ep_prod_lim = lim;
                state.tc_cons_lim = match lim >= 0 {
                    true => (lim - state.handshake_produced as Credit).max(0),
                    false => lim,
                };
                state.tc_cons_lim
            }
            None => core.state.borrow().tc_cons_lim,
        };
        Ok(lim)
    }

    fn tc_end_consume(core: &Rc<Self>, clean: bool) {
        let action = {
            let state = core.state.borrow();
            if state.handshake_error {
                return;
            }
            match state.handshaking {
                true => None,
                false => Some(state.ep_consumer.clone()),
            }
        };
        match action {
            None => Self::handshake_abort(core),
            Some(Some(consumer)) => consumer.end_consume(clean),
            Some(None) => Self::tc_abort(core),
        }
    }

    fn tc_abort(core: &Rc<Self>) {
        let handshaking = {
            let state = core.state.borrow();
            state.handshaking && !state.handshake_error
        };
        if handshaking {
            Self::handshake_abort(core);
            return;
        }
        let (consumer, producer) = {
            let mut state = core.state.borrow_mut();
            (state.ep_consumer.take(), state.tc_producer.take())
        };
        if let Some(consumer) = consumer {
            consumer.abort();
            consumer.detach();
        }
        if let Some(producer) = producer {
            producer.abort();
            producer.detach();
        }
    }

    fn tc_attach(core: &Rc<Self>, producer: &ByteProducerRef) -> IoResult<()> {
        let lim = {
            let mut state = core.state.borrow_mut();
            if state.handshake_error {
                return Err(IoError::Contract("earlier error during handshaking"));
            }
            if let Some(current) = &state.tc_producer {
                if current.endpoint_id() == producer.endpoint_id() {
                    return Ok(());
                }
                return Err(IoError::Contract("producer already attached"));
            }
            state.tc_producer = Some(producer.clone());
            state.tc_cons_lim = 0;

            match state.handshaking {
                false => {
                    // Handshake bytes already sent on the wire count against
                    // the relayed credit
                    let lim = match state.ep_prod_lim >= 0 {
                        true => (state.ep_prod_lim - state.handshake_produced as Credit).max(0),
                        false => state.ep_prod_lim,
                    };
                    state.tc_cons_lim = lim;
                    Some(lim)
                }
                true => None,
            }
        };

        producer.attach(&Self::transport_consume_facade(core))?;
        if let Some(lim) = lim {
            producer.can_produce(lim);
        }
        notify_best_effort(|| producer.control(&ControlMsg::NotifyConsumerAttached));
        Ok(())
    }

    fn tc_detach(core: &Rc<Self>) {
        let producer = {
            let mut state = core.state.borrow_mut();
            match state.tc_producer.take() {
                Some(producer) => {
                    state.tc_cons_lim = 0;
                    producer
                }
                None => return,
            }
        };
        producer.detach();
    }

    // Transport (internal) producer: inbound bytes flow to the consumer
    // attached here; its credit is relayed to the external producer

    fn tp_can_produce(core: &Rc<Self>, limit: Credit) {
        let producer = {
            let mut state = core.state.borrow_mut();
            if state.tp_consumer.is_none() {
                return;
            }
            state.tp_prod_lim = limit;
            match state.handshaking {
                false => state.ec_producer.clone().map(|producer| {
                    let lim = match limit >= 0 {
                        true => limit + state.handshake_consumed as Credit,
                        false => limit,
                    };
                    state.ec_cons_lim = lim;
                    (producer, lim)
                }),
                true => None,
            }
        };
        if let Some((producer, lim)) = producer {
            producer.can_produce(lim);
        }
    }

    fn tp_abort(core: &Rc<Self>) {
        Self::ec_abort(core);
    }

    fn tp_attach(core: &Rc<Self>, consumer: &ByteConsumerRef) -> IoResult<()> {
        {
            let mut state = core.state.borrow_mut();
            if state.handshake_error {
                return Err(IoError::Contract("earlier error during handshaking"));
            }
            if let Some(current) = &state.tp_consumer {
                if current.endpoint_id() == consumer.endpoint_id() {
                    return Ok(());
                }
                return Err(IoError::Contract("consumer already attached"));
            }
            state.tp_consumer = Some(consumer.clone());
            state.tp_prod_lim = 0;
        }

        consumer.attach(&Self::transport_produce_facade(core))?;
        notify_best_effort(|| consumer.control(&ControlMsg::NotifyProducerAttached));
        Ok(())
    }

    fn tp_detach(core: &Rc<Self>) {
        let consumer = {
            let mut state = core.state.borrow_mut();
            match state.tp_consumer.take() {
                Some(consumer) => {
                    state.tp_prod_lim = 0;
                    consumer
                }
                None => return,
            }
        };
        consumer.detach();
    }

    // External consumer: inbound bytes from the wire transport

    fn ec_consume(core: &Rc<Self>, data: &mut Buffer) -> IoResult<Credit> {
        {
            let state = core.state.borrow();
            if state.ec_producer.is_none() {
                return Err(IoError::Contract("no attached producer"));
            }
            if data.is_empty() {
                return Err(IoError::Contract("no data to consume"));
            }
            if state.handshake_error {
                return Err(IoError::Contract("earlier error during handshaking"));
            }
        }

        if core.state.borrow().handshaking {
            Self::handshake_consume(core, data)?;
        }

        // Post-handshake data, including any remainder of the datagram that
        // completed the handshake, passes straight through
        let handshaking = core.state.borrow().handshaking;
        if !handshaking && !data.is_empty() {
            let consumer = core.state.borrow().tp_consumer.clone();
            if let Some(consumer) = consumer {
                let lim = consumer.consume(data)?;
                let mut state = core.state.borrow_mut();
                state.tp_prod_lim = lim;
                state.ec_cons_lim = match lim >= 0 {
                    true => lim + state.handshake_consumed as Credit,
                    false => lim,
                };
            }
        }

        Ok(core.state.borrow().ec_cons_lim)
    }

    fn ec_end_consume(core: &Rc<Self>, clean: bool) {
        let action = {
            let state = core.state.borrow();
            if state.handshake_error {
                return;
            }
            match state.handshaking {
                true => None,
                false => Some(state.tp_consumer.clone()),
            }
        };
        match action {
            None => Self::handshake_abort(core),
            Some(Some(consumer)) => consumer.end_consume(clean),
            Some(None) => {}
        }
    }

    fn ec_abort(core: &Rc<Self>) {
        let handshaking = {
            let state = core.state.borrow();
            state.handshaking && !state.handshake_error
        };
        if handshaking {
            Self::handshake_abort(core);
            return;
        }
        let (consumer, producer) = {
            let mut state = core.state.borrow_mut();
            (state.tp_consumer.take(), state.ec_producer.take())
        };
        if let Some(consumer) = consumer {
            consumer.abort();
            consumer.detach();
        }
        if let Some(producer) = producer {
            producer.abort();
            producer.detach();
        }
    }

    fn ec_attach(core: &Rc<Self>, producer: &ByteProducerRef) -> IoResult<()> {
        {
            let mut state = core.state.borrow_mut();
            if state.handshake_error {
                return Err(IoError::Contract("earlier error during handshaking"));
            }
            if let Some(current) = &state.ec_producer {
                if current.endpoint_id() == producer.endpoint_id() {
                    return Ok(());
                }
                return Err(IoError::Contract("producer already attached"));
            }
            state.ec_producer = Some(producer.clone());
            state.ec_cons_lim = 0;
        }

        producer.attach(&(Rc::new(ExternalConsumerFacade { core: core.clone() }) as ByteConsumerRef))?;
        notify_best_effort(|| producer.control(&ControlMsg::NotifyConsumerAttached));

        Self::handshake_producer_attached(core);
        Ok(())
    }

    fn ec_detach(core: &Rc<Self>) {
        let producer = {
            let mut state = core.state.borrow_mut();
            match state.ec_producer.take() {
                Some(producer) => {
                    state.ec_cons_lim = 0;
                    producer
                }
                None => return,
            }
        };
        producer.detach();
    }

    // External producer: outbound bytes toward the wire transport

    fn ep_can_produce(core: &Rc<Self>, limit: Credit) {
        let forwarded = {
            let mut state = core.state.borrow_mut();
            if state.ep_consumer.is_none() {
                return;
            }
            state.ep_prod_lim = limit;

            match state.handshaking {
                true => None,
                false => state.tc_producer.clone().map(|producer| {
                    let lim = match limit >= 0 {
                        true => (limit - state.handshake_produced as Credit).max(0),
                        false => limit,
                    };
                    state.tc_cons_lim = lim;
                    (producer, lim)
                }),
            }
        };

        match forwarded {
            Some((producer, lim)) => producer.can_produce(lim),
            None => Self::handshake_can_produce(core),
        }
    }

    fn ep_abort(core: &Rc<Self>) {
        Self::tc_abort(core);
    }

    fn ep_attach(core: &Rc<Self>, consumer: &ByteConsumerRef) -> IoResult<()> {
        {
            let mut state = core.state.borrow_mut();
            if state.handshake_error {
                return Err(IoError::Contract("earlier error during handshaking"));
            }
            if let Some(current) = &state.ep_consumer {
                if current.endpoint_id() == consumer.endpoint_id() {
                    return Ok(());
                }
                return Err(IoError::Contract("consumer already attached"));
            }
            state.ep_consumer = Some(consumer.clone());
            state.ep_prod_lim = 0;
        }

        consumer.attach(&(Rc::new(ExternalProducerFacade { core: core.clone() }) as ByteProducerRef))?;
        notify_best_effort(|| consumer.control(&ControlMsg::NotifyProducerAttached));
        Ok(())
    }

    fn ep_detach(core: &Rc<Self>) {
        let consumer = {
            let mut state = core.state.borrow_mut();
            match state.ep_consumer.take() {
                Some(consumer) => {
                    state.ep_prod_lim = 0;
                    consumer
                }
                None => return,
            }
        };
        consumer.detach();
    }

    // Handshake logic

    fn handshake_producer_attached(core: &Rc<Self>) {
        let producer = {
            let mut state = core.state.borrow_mut();
            if !state.handshaking {
                return;
            }
            let listening = match &state.role {
                RoleState::Client { sent_hello } => *sent_hello,
                RoleState::Server { .. } => true,
            };
            match listening && state.ec_producer.is_some() {
                true => {
                    state.ec_cons_lim = HSHAKE_MAXLEN as Credit;
                    state.ec_producer.clone()
                }
                false => None,
            }
        };
        if let Some(producer) = producer {
            producer.can_produce(HSHAKE_MAXLEN as Credit);
        }
    }

    /// Sends the pending hello (client) or reply (server) within the
    /// external producer's credit.
    fn handshake_can_produce(core: &Rc<Self>) {
        enum Outcome {
            ClientSent,
            ServerDone(Option<TransportTag>),
        }

        let (outcome, listen_producer) = {
            let mut state = core.state.borrow_mut();
            if !state.handshaking || state.handshake_error {
                return;
            }

            let pending = match &state.role {
                RoleState::Client { sent_hello } => !*sent_hello && !state.buf.is_empty(),
                RoleState::Server { have_hello, .. } => *have_hello && !state.buf.is_empty(),
            };
            if !pending {
                return;
            }

            let consumer = match &state.ep_consumer {
                Some(consumer) => consumer.clone(),
                None => return,
            };
            if headroom(state.handshake_produced, state.ep_prod_lim) == 0 {
                return;
            }

            let mut send = std::mem::replace(&mut state.buf, Buffer::new(HSHAKE_MAXLEN));
            let before = send.len();
            drop(state);

            let result = consumer.consume(&mut send);

            let mut state = core.state.borrow_mut();
            let sent = before - send.len();
            state.handshake_produced += sent as u64;
            let drained = send.is_empty();
            // Any unsent remainder stays buffered for the next credit
            state.buf = send;

            match result {
                Ok(new_lim) => state.ep_prod_lim = new_lim,
                Err(IoError::Wait) | Err(IoError::MissingControl) => {}
                Err(_) => {
                    drop(state);
                    Self::handshake_abort(core);
                    return;
                }
            }

            if !drained {
                return;
            }

            let state = &mut *state;
            match &mut state.role {
                RoleState::Client { sent_hello } => {
                    *sent_hello = true;
                    let producer = state.ec_producer.clone();
                    if producer.is_some() {
                        state.ec_cons_lim = HSHAKE_MAXLEN as Credit;
                    }
                    (Outcome::ClientSent, producer)
                }
                RoleState::Server { negotiated, .. } => {
                    (Outcome::ServerDone(negotiated.take()), None)
                }
            }
        };

        match outcome {
            Outcome::ClientSent => {
                logging::debug!(core.log, "client hello sent");
                if let Some(producer) = listen_producer {
                    producer.can_produce(HSHAKE_MAXLEN as Credit);
                }
            }
            Outcome::ServerDone(tag) => {
                let tag = tag.expect("Server reply sent without negotiation");
                Self::handshake_complete(core, tag);
            }
        }
    }

    /// Collects and parses the peer's handshake line.
    fn handshake_consume(core: &Rc<Self>, data: &mut Buffer) -> IoResult<()> {
        let line = {
            let mut state = core.state.borrow_mut();
            if !state.handshaking || state.handshake_error {
                return Ok(());
            }
            // The client listens only after its hello went out; the server
            // listens from the start
            let listening = match &state.role {
                RoleState::Client { sent_hello } => *sent_hello,
                RoleState::Server { have_hello, .. } => !*have_hello,
            };
            if !listening {
                return Ok(());
            }

            let mut complete = false;
            while !data.is_empty() && state.buf.len() < HSHAKE_MAXLEN {
                let byte = data.pop(1);
                state.buf.append(&byte);
                state.handshake_consumed += 1;
                if byte[0] == b'\n' {
                    complete = true;
                    break;
                }
            }

            if !complete {
                if state.buf.len() >= HSHAKE_MAXLEN {
                    drop(state);
                    Self::handshake_abort(core);
                    return Err(IoError::Protocol("handshake exceeded byte limit"));
                }
                return Ok(());
            }

            let mut line = state.buf.pop_all();
            line.pop();
            line
        };

        let result = Self::handshake_line(core, &line);
        if result.is_err() {
            Self::handshake_abort(core);
        }
        result
    }

    /// Interprets a complete handshake line for the current role.
    fn handshake_line(core: &Rc<Self>, line: &[u8]) -> IoResult<()> {
        let is_client = {
            let state = core.state.borrow();
            matches!(state.role, RoleState::Client { .. })
        };

        if is_client {
            // Server response: USE_TRANSPORT selection
            if line.len() <= SERVER_HELLO_PREFIX.len()
                || &line[..SERVER_HELLO_PREFIX.len()] != SERVER_HELLO_PREFIX
            {
                return Err(IoError::Protocol("malformed transport selection"));
            }
            let tag = TransportTag::parse(&line[SERVER_HELLO_PREFIX.len()..])
                .ok_or(IoError::Protocol("unknown transport tag"))?;

            let enabled = {
                let state = core.state.borrow();
                match tag {
                    TransportTag::Vts => state.vts_factory.is_some(),
                    TransportTag::Tls => state.tls_factory.is_some(),
                    TransportTag::Plain => state.allow_insecure,
                }
            };
            if !enabled {
                return Err(IoError::Protocol("peer selected a disabled transport"));
            }

            logging::debug!(core.log, "negotiated transport"; "transport" => ?tag);
            Self::handshake_complete(core, tag);
            Ok(())
        } else {
            // Client hello: TRANSPORTS tag list
            if line.len() <= CLIENT_HELLO_PREFIX.len() + 1
                || &line[..CLIENT_HELLO_PREFIX.len()] != CLIENT_HELLO_PREFIX
                || line[CLIENT_HELLO_PREFIX.len()] != b':'
            {
                return Err(IoError::Protocol("malformed transport list"));
            }

            let mut offered = Vec::new();
            for raw in line[CLIENT_HELLO_PREFIX.len() + 1..].split(|&byte| byte == b':') {
                let tag = TransportTag::parse(raw)
                    .ok_or(IoError::Protocol("unknown transport tag"))?;
                if offered.contains(&tag) {
                    return Err(IoError::Protocol("duplicate transport tag"));
                }
                offered.push(tag);
            }

            let (selection, reply_due) = {
                let mut state = core.state.borrow_mut();
                let selection = if offered.contains(&TransportTag::Vts)
                    && state.vts_factory.is_some()
                {
                    TransportTag::Vts
                } else if offered.contains(&TransportTag::Tls) && state.tls_factory.is_some() {
                    TransportTag::Tls
                } else if offered.contains(&TransportTag::Plain) && state.allow_insecure {
                    TransportTag::Plain
                } else {
                    return Err(IoError::Protocol("no mutually enabled transport"));
                };

                match &mut state.role {
                    RoleState::Server {
                        have_hello,
                        negotiated,
                    } => {
                        *have_hello = true;
                        *negotiated = Some(selection);
                    }
                    RoleState::Client { .. } => unreachable!("client parsing server state"),
                }

                let mut reply = Vec::new();
                reply.extend_from_slice(SERVER_HELLO_PREFIX);
                reply.extend_from_slice(selection.as_bytes());
                reply.push(b'\n');
                state.buf.append(&reply);

                (selection, state.ep_prod_lim != 0)
            };

            logging::debug!(core.log, "negotiated transport"; "transport" => ?selection);

            if reply_due {
                let core = core.clone();
                core.sched.clone().defer(move || Self::handshake_can_produce(&core));
            }
            Ok(())
        }
    }

    /// Splices the negotiated transport between the external side and the
    /// retained channel byte pair.
    fn handshake_complete(core: &Rc<Self>, tag: TransportTag) {
        let (vec_consumer, vec_producer, factory) = {
            let mut state = core.state.borrow_mut();
            state.handshaking = false;
            let factory = match tag {
                TransportTag::Vts => state.vts_factory.take(),
                TransportTag::Tls => state.tls_factory.take(),
                TransportTag::Plain => None,
            };
            (
                state.vec_consumer.take(),
                state.vec_producer.take(),
                factory,
            )
        };

        let vec_consumer = match vec_consumer {
            Some(consumer) => consumer,
            None => return,
        };
        let vec_producer = match vec_producer {
            Some(producer) => producer,
            None => return,
        };

        let spliced = match factory {
            None => {
                // Plaintext: the channel pair carries the wire data directly
                Self::tc_attach(core, &vec_producer)
                    .and_then(|()| Self::tp_attach(core, &vec_consumer))
            }
            Some(factory) => match factory(&core.sched) {
                Ok(endpoints) => Self::tc_attach(core, &endpoints.ext_producer)
                    .and_then(|()| Self::tp_attach(core, &endpoints.ext_consumer))
                    .and_then(|()| endpoints.int_consumer.attach(&vec_producer))
                    .and_then(|()| endpoints.int_producer.attach(&vec_consumer)),
                Err(err) => Err(err),
            },
        };

        // Factories and channel references held for the handshake are gone;
        // the attachments now own the chain
        {
            let mut state = core.state.borrow_mut();
            state.vts_factory = None;
            state.tls_factory = None;
        }

        match spliced {
            Ok(()) => logging::debug!(core.log, "handshake complete"),
            Err(_) => Self::handshake_abort(core),
        }
    }

    /// Aborts the bridge: both external sides, the retained channel pair,
    /// and any held factories are released.
    fn handshake_abort(core: &Rc<Self>) {
        let (vec_consumer, vec_producer) = {
            let mut state = core.state.borrow_mut();
            if state.handshake_error {
                return;
            }
            state.handshaking = false;
            state.handshake_error = true;
            (state.vec_consumer.take(), state.vec_producer.take())
        };
        logging::debug!(core.log, "handshake aborted");

        Self::ec_abort(core);
        Self::ep_abort(core);

        if let Some(consumer) = vec_consumer {
            consumer.abort();
        }
        if let Some(producer) = vec_producer {
            producer.abort();
        }

        let mut state = core.state.borrow_mut();
        state.vts_factory = None;
        state.tls_factory = None;
    }
}

// ================================================================== facades

struct TransportConsumerFacade {
    core: Rc<VopCore>,
}

impl ByteConsumer for TransportConsumerFacade {
    fn consume(&self, data: &mut Buffer) -> IoResult<Credit> {
        VopCore::tc_consume(&self.core, data)
    }

    fn end_consume(&self, clean: bool) {
        VopCore::tc_end_consume(&self.core, clean)
    }

    fn abort(&self) {
        VopCore::tc_abort(&self.core)
    }

    fn attach(&self, producer: &ByteProducerRef) -> IoResult<()> {
        VopCore::tc_attach(&self.core, producer)
    }

    fn detach(&self) {
        VopCore::tc_detach(&self.core)
    }

    fn endpoint_id(&self) -> EndpointId {
        EndpointId::new(&self.core, Role::Consumer)
    }
}

struct TransportProducerFacade {
    core: Rc<VopCore>,
}

impl ByteProducer for TransportProducerFacade {
    fn can_produce(&self, limit: Credit) {
        VopCore::tp_can_produce(&self.core, limit)
    }

    fn abort(&self) {
        VopCore::tp_abort(&self.core)
    }

    fn attach(&self, consumer: &ByteConsumerRef) -> IoResult<()> {
        VopCore::tp_attach(&self.core, consumer)
    }

    fn detach(&self) {
        VopCore::tp_detach(&self.core)
    }

    fn endpoint_id(&self) -> EndpointId {
        EndpointId::new(&self.core, Role::Producer)
    }
}

struct ExternalConsumerFacade {
    core: Rc<VopCore>,
}

impl ByteConsumer for ExternalConsumerFacade {
    fn consume(&self, data: &mut Buffer) -> IoResult<Credit> {
        VopCore::ec_consume(&self.core, data)
    }

    fn end_consume(&self, clean: bool) {
        VopCore::ec_end_consume(&self.core, clean)
    }

    fn abort(&self) {
        VopCore::ec_abort(&self.core)
    }

    fn attach(&self, producer: &ByteProducerRef) -> IoResult<()> {
        VopCore::ec_attach(&self.core, producer)
    }

    fn detach(&self) {
        VopCore::ec_detach(&self.core)
    }

    fn endpoint_id(&self) -> EndpointId {
        EndpointId::new(&self.core, Role::Consumer)
    }
}

struct ExternalProducerFacade {
    core: Rc<VopCore>,
}

impl ByteProducer for ExternalProducerFacade {
    fn can_produce(&self, limit: Credit) {
        VopCore::ep_can_produce(&self.core, limit)
    }

    fn abort(&self) {
        VopCore::ep_abort(&self.core)
    }

    fn attach(&self, consumer: &ByteConsumerRef) -> IoResult<()> {
        VopCore::ep_attach(&self.core, consumer)
    }

    fn detach(&self) {
        VopCore::ep_detach(&self.core)
    }

    fn endpoint_id(&self) -> EndpointId {
        EndpointId::new(&self.core, Role::Producer)
    }
}
