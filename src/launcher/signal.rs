use tokio::sync::watch;

/// Creates a linked interrupt trigger/listener pair.
pub fn interrupt_channel() -> (InterruptTrigger, InterruptListener) {
    let (tx, rx) = watch::channel(0u32);
    (InterruptTrigger { tx }, InterruptListener { rx })
}

/// Operator side: fired once per Ctrl+C / SIGTERM.
#[derive(Debug, Clone)]
pub struct InterruptTrigger {
    tx: watch::Sender<u32>,
}

impl InterruptTrigger {
    pub fn fire(&self) {
        self.tx.send_modify(|count| *count = count.saturating_add(1));
    }
}

/// Orchestrator side: observes how many interrupts have been requested.
#[derive(Debug, Clone)]
pub struct InterruptListener {
    rx: watch::Receiver<u32>,
}

impl InterruptListener {
    /// A listener that never fires, for callers with no operator attached.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(0u32);
        Self { rx }
    }

    pub fn count(&self) -> u32 {
        *self.rx.borrow()
    }

    pub fn is_triggered(&self) -> bool {
        self.count() > 0
    }

    /// Resolves once at least `n` interrupts have been fired.
    pub async fn reached(&self, n: u32) {
        let mut rx = self.rx.clone();
        let closed = rx.wait_for(|count| *count >= n).await.is_err();
        if closed {
            // Trigger dropped: no further interrupts can arrive.
            std::future::pending::<()>().await;
        }
    }

    pub async fn triggered(&self) {
        self.reached(1).await
    }
}

/// Wait for CTRL+C or SIGTERM and forward every occurrence into `trigger`.
pub async fn forward_os_signals(trigger: InterruptTrigger) {
    #[cfg(unix)]
    let mut terminate =
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(signal) => Some(signal),
            Err(e) => {
                log::error!("failed to install SIGTERM handler: {e}");
                None
            }
        };

    loop {
        #[cfg(unix)]
        let terminated = async {
            match terminate.as_mut() {
                Some(signal) => {
                    signal.recv().await;
                }
                None => std::future::pending::<()>().await,
            }
        };

        #[cfg(not(unix))]
        let terminated = std::future::pending::<()>();

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    log::error!("failed to listen for Ctrl+C: {e}");
                    return;
                }
                log::info!("Received CTRL+C, shutting down...");
            }
            _ = terminated => {
                log::info!("Received SIGTERM, shutting down...");
            }
        }

        trigger.fire();
    }
}
