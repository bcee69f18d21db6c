//! Dedicated controller thread.
//!
//! One OS thread per link owns the [`Controller`] and the SPI transport. SPI
//! transfers block, so the thread runs its own current-thread runtime and
//! never borrows a worker of the application's runtime. Clients never touch
//! the controller; they flip channel state in the shared context and wake the
//! thread through the edge-signal wake primitive.
//!
//! # Architecture
//!
//! ```text
//! ChannelHandle ─┐                          ┌─► has-data / ready edges
//! ChannelHandle ─┼─► LinkContext + wake ─► Controller Thread ─► SpiTransport
//! Link ──────────┘   (mpsc: raw transfers)  └─► channel RX pipelines
//! ```
//!
//! # Loop
//!
//! - stop flag checked at the top of every iteration
//! - suspended: no transfers, only raw passthrough requests are served
//! - optional gate on the device ready line
//! - one transaction per iteration; busy work continues immediately, an idle
//!   link sleeps until an edge, a client wake-up or the idle poll period

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::context::LinkContext;
use crate::controller::{Controller, LinkState, StepOutcome};
use crate::error::{Result, StpError};
use crate::protocol::kind;
use crate::transport::{fastpath, SpiMessage, SpiTransfer, SpiTransport};

/// Capacity of the request channel into the controller thread.
pub const DEFAULT_REQUEST_CAPACITY: usize = 16;

/// Work handed to the controller thread from outside the protocol.
#[derive(Debug)]
pub(crate) enum WorkerRequest {
    /// Full-duplex transfer outside STP framing; only served while suspended.
    RawTransfer {
        tx: Vec<u8>,
        reply: oneshot::Sender<Result<Vec<u8>>>,
    },
}

/// Handle to a running controller thread.
pub(crate) struct ControllerThread {
    result: oneshot::Receiver<Result<()>>,
}

impl ControllerThread {
    /// Wait for the thread to exit; returns the error that stopped it.
    pub(crate) async fn join(self) -> Result<()> {
        match self.result.await {
            Ok(result) => result,
            Err(_) => {
                tracing::error!("Controller thread exited without a result");
                Err(StpError::LinkStopped)
            }
        }
    }
}

/// Spawn the controller thread for `controller` over `transport`.
///
/// The thread runs until the link is stopped, the request channel closes, or
/// the transport fails with a non-retryable error. In every case the context
/// ends up stopped so blocked clients are released.
pub(crate) fn spawn_controller_thread<T>(
    controller: Controller,
    transport: T,
    requests: mpsc::Receiver<WorkerRequest>,
) -> Result<ControllerThread>
where
    T: SpiTransport + 'static,
{
    let (done, result) = oneshot::channel();
    thread::Builder::new()
        .name("stp-controller".to_string())
        .spawn(move || {
            let ctx = controller.context().clone();
            let outcome = match tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
            {
                Ok(runtime) => runtime.block_on(controller_task(controller, transport, requests)),
                Err(e) => {
                    tracing::error!("Failed to start controller runtime: {}", e);
                    ctx.signals().teardown();
                    ctx.stop();
                    Err(StpError::Io(e))
                }
            };
            // Nobody may be waiting for the result.
            let _ = done.send(outcome);
        })?;
    Ok(ControllerThread { result })
}

async fn controller_task<T>(
    mut controller: Controller,
    mut spi: T,
    mut requests: mpsc::Receiver<WorkerRequest>,
) -> Result<()>
where
    T: SpiTransport,
{
    let ctx = controller.context().clone();
    let fastpath = ctx.config().use_fastpath;

    let result = match prepare(&mut spi, fastpath) {
        Ok(()) => controller_loop(&mut controller, &mut spi, &mut requests, &ctx).await,
        Err(e) => Err(e),
    };

    if fastpath {
        if let Err(e) = spi.unprepare() {
            tracing::warn!("Failed to release SPI hardware: {}", e);
        }
    }
    ctx.signals().teardown();
    ctx.stop();

    match &result {
        Ok(()) => tracing::debug!("Controller thread exited"),
        Err(e) => tracing::error!("Controller thread failed: {}", e),
    }
    result
}

fn prepare<T: SpiTransport>(spi: &mut T, fastpath: bool) -> Result<()> {
    if fastpath {
        spi.prepare()?;
    }
    Ok(())
}

async fn controller_loop<T>(
    controller: &mut Controller,
    spi: &mut T,
    requests: &mut mpsc::Receiver<WorkerRequest>,
    ctx: &Arc<LinkContext>,
) -> Result<()>
where
    T: SpiTransport,
{
    let idle = ctx.config().idle_poll();
    let signals = ctx.signals().clone();

    loop {
        if ctx.is_stopped() {
            return Ok(());
        }

        loop {
            match requests.try_recv() {
                Ok(request) => serve(request, spi, ctx),
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    tracing::debug!("Request channel closed, stopping controller");
                    return Ok(());
                }
            }
        }

        if ctx.is_suspended() {
            tokio::select! {
                _ = signals.notified() => {}
                request = requests.recv() => match request {
                    Some(request) => serve(request, spi, ctx),
                    None => return Ok(()),
                },
                _ = tokio::time::sleep(idle) => {}
            }
            continue;
        }

        if ctx.config().wait_for_device_ready && !signals.take_device_ready() {
            // Gate on the ready edge, but never longer than one poll period.
            tokio::select! {
                _ = signals.ready_notified() => {}
                _ = signals.notified() => {}
                _ = tokio::time::sleep(idle) => {}
            }
            if ctx.is_stopped() || ctx.is_suspended() {
                continue;
            }
            signals.take_device_ready();
        }

        let peer_has_data = signals.take_has_data();
        let outcome = controller.step(spi)?;

        if keep_going(controller, outcome, peer_has_data) {
            tokio::task::yield_now().await;
        } else {
            wait_for_wake(ctx, idle).await;
        }
    }
}

/// Whether the next transaction should follow without waiting.
fn keep_going(controller: &Controller, outcome: StepOutcome, peer_has_data: bool) -> bool {
    match outcome {
        StepOutcome::Retry => true,
        StepOutcome::Rejected { .. } => false,
        StepOutcome::Exchanged { received, .. } => match controller.state() {
            LinkState::Unsynced => received == kind::SYNC,
            LinkState::Synced => {
                peer_has_data || received != kind::EMPTY || controller.has_pending_work()
            }
        },
    }
}

async fn wait_for_wake(ctx: &LinkContext, idle: Duration) {
    tokio::select! {
        _ = ctx.signals().notified() => {}
        _ = tokio::time::sleep(idle) => {}
    }
}

fn serve<T: SpiTransport>(request: WorkerRequest, spi: &mut T, ctx: &LinkContext) {
    match request {
        WorkerRequest::RawTransfer { tx, reply } => {
            let result = raw_transfer(spi, ctx, tx);
            // Caller may have given up waiting.
            let _ = reply.send(result);
        }
    }
}

fn raw_transfer<T: SpiTransport>(spi: &mut T, ctx: &LinkContext, tx: Vec<u8>) -> Result<Vec<u8>> {
    if !ctx.is_suspended() {
        return Err(StpError::InvalidParameters(
            "raw transfers need a suspended link".to_string(),
        ));
    }
    if tx.is_empty() {
        return Ok(Vec::new());
    }

    let mut msg = SpiMessage::single(SpiTransfer::from_tx(tx, ctx.config().speed_hz));
    if ctx.config().use_fastpath {
        fastpath::transfer_one_message(spi, &mut msg)?;
    } else {
        spi.transfer(&mut msg)?;
    }
    tracing::trace!("Raw transfer of {} bytes", msg.actual_length);

    let mut transfers = msg.transfers;
    Ok(transfers.pop().map(|t| t.rx_buf).unwrap_or_default())
}
