#![no_main]

use libfuzzer_sys::fuzz_target;

use mediagate::media::ssrf::UrlPolicy;
use std::net::IpAddr;

fuzz_target!(|data: &str| {
    // Must never panic, under any policy.
    for policy in [
        UrlPolicy::default(),
        UrlPolicy {
            allow_http: true,
            allow_private_networks: true,
        },
    ] {
        let checked = policy.check_url(data);

        // Anything accepted must be http(s) with a host.
        if let Ok(url) = checked {
            assert!(matches!(url.scheme(), "http" | "https"));
            assert!(url.host().is_some());
        }

        if let Ok(ip) = data.parse::<IpAddr>() {
            let _ = policy.check_resolved("fuzz-host", ip);
        }
    }
});
