//! Statsd reporting for the cache.
//!
//! Nothing is sent until [`configure_statsd`] installed a reporter. Emit metrics through the
//! [`metric!`](crate::metric) macro.

use std::collections::BTreeMap;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::OnceLock;

use cadence::{Metric, MetricBuilder, StatsdClient, UdpMetricSink};

use crate::config::Metrics;

static REPORTER: OnceLock<Reporter> = OnceLock::new();

#[doc(hidden)]
pub mod prelude {
    pub use cadence::prelude::*;
}

/// A statsd client together with the tags attached to every metric.
#[derive(Debug)]
pub struct Reporter {
    client: StatsdClient,
    default_tags: BTreeMap<String, String>,
}

impl Reporter {
    pub fn client(&self) -> &StatsdClient {
        &self.client
    }

    /// Adds the default tags and sends the metric.
    #[inline(always)]
    pub fn send<'a, T>(&'a self, metric: MetricBuilder<'a, '_, T>)
    where
        T: Metric + From<String>,
    {
        self.default_tags
            .iter()
            .fold(metric, |metric, (tag, value)| metric.with_tag(tag, value))
            .send()
    }
}

/// Starts reporting metrics to the statsd server from the metrics config.
///
/// Does nothing without a configured server. Only the first successful call installs a
/// reporter.
pub fn configure_statsd(config: &Metrics) -> io::Result<()> {
    let Some(ref host) = config.statsd else {
        return Ok(());
    };

    let addrs: Vec<SocketAddr> = host.as_str().to_socket_addrs()?.collect();
    let Some(addr) = addrs.first() else {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("statsd host `{host}` did not resolve"),
        ));
    };
    tracing::info!(%addr, prefix = %config.prefix, "reporting metrics to statsd");

    let socket = UdpSocket::bind(("0.0.0.0", 0))?;
    socket.set_nonblocking(true)?;
    let sink = UdpMetricSink::from(&addrs[..], socket).map_err(io::Error::other)?;

    let reporter = Reporter {
        client: StatsdClient::from_sink(&config.prefix, sink),
        default_tags: config.custom_tags.clone(),
    };
    if REPORTER.set(reporter).is_err() {
        tracing::warn!("statsd reporting was already configured");
    }
    Ok(())
}

/// Calls `f` with the installed reporter, if any.
#[inline(always)]
pub fn with_reporter<F>(f: F)
where
    F: FnOnce(&Reporter),
{
    if let Some(reporter) = REPORTER.get() {
        f(reporter);
    }
}

/// Emits a counter, gauge or timer.
///
/// ```ignore
/// metric!(counter("cache.hit") += 1);
/// metric!(gauge("cache.count") = 3u64);
/// metric!(timer("fetch.duration") = elapsed, "outcome" => "ok");
/// ```
#[macro_export]
macro_rules! metric {
    (counter($id:expr) += $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metric!(@send count_with_tags, $id, $value $(, $k => $v)*)
    };
    (gauge($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metric!(@send gauge_with_tags, $id, $value $(, $k => $v)*)
    };
    (timer($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metric!(@send time_with_tags, $id, $value $(, $k => $v)*)
    };
    (@send $method:ident, $id:expr, $value:expr $(, $k:expr => $v:expr)*) => {{
        use $crate::metrics::prelude::*;
        $crate::metrics::with_reporter(|reporter| {
            reporter.send(reporter.client().$method($id, $value) $(.with_tag($k, $v))*);
        })
    }};
}
