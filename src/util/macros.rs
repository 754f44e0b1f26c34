/// Run a block inside its own tracing span and report it as a progress step.
///
/// ```rs
/// stage!(progress, 0.95, "Syncing filesystem…" {
///     host.exec(&Cmd::fatal("sync"))?;
/// });
/// ```
#[macro_export]
macro_rules! stage {
    ($progress:expr, $fraction:expr, $s:literal $body:block) => {{
        let s = tracing::info_span!($s);
        $progress.report($s, $fraction);

        {
            let _guard = s.enter();
            tracing::debug!("Entering stage");
            $body
        }
    }};
}
