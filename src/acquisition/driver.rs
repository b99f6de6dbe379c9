//! Paired-channel run supervision.
//!
//! The driver owns both channel pollers and runs them one repetition at a
//! time: each repetition spawns a cycle on each channel, then waits for both
//! to come back before starting the next. The barrier keeps the pair aligned
//! on the same water even when one channel burns its retry budget. Shutdown
//! is observed between repetitions, never mid-cycle, so a record in flight
//! is always finished or cleanly dropped.

use super::{Channel, ChannelPoller, CycleError, CycleOutcome};
use crate::shutdown::ShutdownToken;
use tracing::info;

/// Per-channel completion counts for a finished run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AcquisitionReport {
    /// Downwelling cycles that produced a record.
    pub downwelling_completed: u32,
    /// Downwelling cycles abandoned to a drop.
    pub downwelling_dropped: u32,
    /// Upwelling cycles that produced a record.
    pub upwelling_completed: u32,
    /// Upwelling cycles abandoned to a drop.
    pub upwelling_dropped: u32,
    /// Repetitions actually run before the end of the run or shutdown.
    pub repetitions_run: u32,
}

impl AcquisitionReport {
    fn tally(&mut self, channel: Channel, outcome: &CycleOutcome) {
        let slot = match (channel, outcome) {
            (Channel::Downwelling, CycleOutcome::Completed) => &mut self.downwelling_completed,
            (Channel::Downwelling, CycleOutcome::Dropped(_)) => &mut self.downwelling_dropped,
            (Channel::Upwelling, CycleOutcome::Completed) => &mut self.upwelling_completed,
            (Channel::Upwelling, CycleOutcome::Dropped(_)) => &mut self.upwelling_dropped,
        };
        *slot += 1;
    }
}

/// Runs the two radiometer channels in lockstep.
pub struct AcquisitionDriver {
    downwelling: ChannelPoller,
    upwelling: ChannelPoller,
    repetitions: u32,
    shutdown: ShutdownToken,
}

impl AcquisitionDriver {
    /// Pair the two channel pollers for a run of `repetitions` cycles.
    pub fn new(
        downwelling: ChannelPoller,
        upwelling: ChannelPoller,
        repetitions: u32,
        shutdown: ShutdownToken,
    ) -> Self {
        Self {
            downwelling,
            upwelling,
            repetitions,
            shutdown,
        }
    }

    /// Run every repetition, then flush both sinks. Dropped cycles are
    /// tallied and the run continues; a [`CycleError`] ends it.
    pub async fn run(mut self) -> Result<AcquisitionReport, CycleError> {
        info!(repetitions = self.repetitions, "starting acquisition run");
        let mut report = AcquisitionReport::default();

        for repetition in 1..=self.repetitions {
            if self.shutdown.is_cancelled() {
                info!(repetition, "shutdown requested, ending run early");
                break;
            }

            let mut downwelling = self.downwelling;
            let mut upwelling = self.upwelling;
            let down_task = tokio::spawn(async move {
                let outcome = downwelling.run_cycle().await;
                (downwelling, outcome)
            });
            let up_task = tokio::spawn(async move {
                let outcome = upwelling.run_cycle().await;
                (upwelling, outcome)
            });

            let (down_joined, up_joined) = tokio::join!(down_task, up_task);
            let (downwelling, down_outcome) =
                down_joined.map_err(|e| CycleError::ChannelTask(e.to_string()))?;
            let (upwelling, up_outcome) =
                up_joined.map_err(|e| CycleError::ChannelTask(e.to_string()))?;
            self.downwelling = downwelling;
            self.upwelling = upwelling;

            report.tally(Channel::Downwelling, &down_outcome?);
            report.tally(Channel::Upwelling, &up_outcome?);
            report.repetitions_run = repetition;
            info!(
                repetition,
                total = self.repetitions,
                "repetition complete"
            );
        }

        self.downwelling.flush().await?;
        self.upwelling.flush().await?;
        info!(
            downwelling_completed = report.downwelling_completed,
            downwelling_dropped = report.downwelling_dropped,
            upwelling_completed = report.upwelling_completed,
            upwelling_dropped = report.upwelling_dropped,
            "acquisition run finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::PollProfile;
    use crate::config::AcquisitionSettings;
    use crate::gateway::sim::{ScriptedBus, ScriptedReply, SimBus};
    use crate::gateway::RegisterBus;
    use crate::records::{MeasurementRecord, MemorySink};
    use crate::shutdown;
    use std::sync::Arc;

    async fn poller_on(
        bus: &Arc<dyn RegisterBus>,
        channel: Channel,
        slave: u8,
    ) -> (ChannelPoller, MemorySink<MeasurementRecord>) {
        let sink = MemorySink::new();
        let profile = PollProfile::from(&AcquisitionSettings::default());
        let poller = ChannelPoller::new(
            channel,
            slave,
            profile,
            Arc::clone(bus),
            Box::new(sink.clone()),
        )
        .await;
        (poller, sink)
    }

    #[tokio::test(start_paused = true)]
    async fn both_channels_complete_every_repetition() {
        let bus: Arc<dyn RegisterBus> = Arc::new(SimBus::new());
        let (down, down_sink) = poller_on(&bus, Channel::Downwelling, 2).await;
        let (up, up_sink) = poller_on(&bus, Channel::Upwelling, 1).await;
        let (_controller, token) = shutdown::channel();

        let report = AcquisitionDriver::new(down, up, 3, token)
            .run()
            .await
            .expect("simulated run should succeed");

        assert_eq!(report.repetitions_run, 3);
        assert_eq!(report.downwelling_completed, 3);
        assert_eq!(report.upwelling_completed, 3);
        assert_eq!(report.downwelling_dropped, 0);
        assert_eq!(report.upwelling_dropped, 0);
        assert_eq!(down_sink.records().await.len(), 3);
        assert_eq!(up_sink.records().await.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_before_the_run_writes_nothing() {
        let bus: Arc<dyn RegisterBus> = Arc::new(SimBus::new());
        let (down, down_sink) = poller_on(&bus, Channel::Downwelling, 2).await;
        let (up, _up_sink) = poller_on(&bus, Channel::Upwelling, 1).await;
        let (controller, token) = shutdown::channel();
        controller.shutdown();

        let report = AcquisitionDriver::new(down, up, 24, token)
            .run()
            .await
            .expect("an empty run still flushes cleanly");

        assert_eq!(report.repetitions_run, 0);
        assert!(down_sink.records().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_request_aborts_the_run() {
        let scripted = Arc::new(ScriptedBus::new());
        scripted.push_reply(ScriptedReply::RejectRequest).await;
        let bus: Arc<dyn RegisterBus> = scripted;
        let (down, _down_sink) = poller_on(&bus, Channel::Downwelling, 2).await;
        let (up, _up_sink) = poller_on(&bus, Channel::Upwelling, 1).await;
        let (_controller, token) = shutdown::channel();

        let error = AcquisitionDriver::new(down, up, 3, token)
            .run()
            .await
            .expect_err("a rejected request is fatal");
        assert!(matches!(error, CycleError::Gateway(_)));
    }
}
