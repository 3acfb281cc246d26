#![forbid(unsafe_code)]

use crate::Engine;
use crossbeam_channel::{Sender, bounded, select, tick};
use std::io;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Background fragment sweeper. One named thread wakes on a fixed
/// interval and calls `Engine::sweep_fragments`; `shutdown` stops the
/// loop after any in-flight sweep and joins. Dropping a running `Reaper`
/// without calling `shutdown` detaches the thread instead.
#[derive(Debug)]
pub struct Reaper {
    stop: Sender<()>,
    handle: thread::JoinHandle<()>,
}

impl Reaper {
    pub fn spawn(engine: Arc<Engine>, interval: Duration) -> io::Result<Reaper> {
        let (stop, stop_rx) = bounded::<()>(1);
        let ticker = tick(interval);
        let handle = thread::Builder::new()
            .name("frag-reaper".into())
            .spawn(move || {
                loop {
                    select! {
                        recv(ticker) -> _ => {
                            engine.sweep_fragments(Instant::now());
                        }
                        recv(stop_rx) -> _ => break,
                    }
                }
            })?;
        Ok(Reaper { stop, handle })
    }

    pub fn shutdown(self) {
        let _ = self.stop.send(());
        let _ = self.handle.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FilterAction, Rule, RulePolicy, names};
    use packet_types::{AddrFamily, FragmentHeader, IpProtocol};

    #[test]
    fn shutdown_joins_cleanly() {
        let engine = Arc::new(Engine::default());
        let reaper = Reaper::spawn(Arc::clone(&engine), Duration::from_millis(5)).unwrap();
        thread::sleep(Duration::from_millis(25));
        reaper.shutdown();
    }

    #[test]
    fn a_running_reaper_evicts_idle_entries() {
        let engine = Arc::new(Engine::default());
        engine
            .reload(vec![
                Rule::build(AddrFamily::V4, FilterAction::Pass)
                    .protocol(IpProtocol::Udp)
                    .finish(),
            ])
            .unwrap();
        engine.set_tunable(names::FRAG_TTL_SECS, 1).unwrap();

        // a timestamp old enough that the entry is already idle-expired
        let Some(past) = Instant::now().checked_sub(Duration::from_secs(5)) else {
            return;
        };
        let frag = FragmentHeader {
            src_addr: "10.0.0.1".parse().unwrap(),
            dst_addr: "10.0.0.2".parse().unwrap(),
            protocol: IpProtocol::Udp,
            ip_id: 1,
            is_first_fragment: true,
            ttl: 64,
            len: 512,
        };
        assert_eq!(engine.filter_fragment(&frag, past).action, RulePolicy::Pass);
        assert_eq!(engine.fragments().len(), 1);

        let reaper = Reaper::spawn(Arc::clone(&engine), Duration::from_millis(10)).unwrap();
        thread::sleep(Duration::from_millis(100));
        reaper.shutdown();

        assert_eq!(engine.fragments().len(), 0);
        assert!(engine.frag_stats().expired >= 1);
    }
}
