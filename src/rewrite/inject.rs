//! Behavior-override script injected into proxied HTML
//!
//! Runs before any page script: overrides geolocation, language, and
//! timezone APIs to match the egress profile while preserving real device
//! characteristics. The fixed element id doubles as the re-injection guard.

use crate::config::SpoofConfig;

/// Element id carried by the injected script block
pub const OVERRIDE_SCRIPT_ID: &str = "gateway-override";

/// Build the override script block for the configured spoof profile
pub fn build_override_script(spoof: &SpoofConfig) -> String {
    format!(
        r#"<script id="{id}">(function() {{
    'use strict';

    var spoof = {{
        timezone: '{timezone}',
        language: '{language}',
        languages: ['{language}', 'en-US', 'en'],
        coords: {{
            latitude: {latitude},
            longitude: {longitude},
            accuracy: {accuracy},
            altitude: null,
            altitudeAccuracy: null,
            heading: null,
            speed: null
        }}
    }};

    if (navigator.geolocation) {{
        var position = {{ coords: spoof.coords, timestamp: Date.now() }};
        navigator.geolocation.getCurrentPosition = function(success) {{
            setTimeout(function() {{ success(position); }}, 100);
        }};
        navigator.geolocation.watchPosition = function(success) {{
            return setInterval(function() {{ success(position); }}, 1000);
        }};
    }}

    Object.defineProperty(navigator, 'language', {{
        get: function() {{ return spoof.language; }}
    }});
    Object.defineProperty(navigator, 'languages', {{
        get: function() {{ return spoof.languages; }}
    }});

    var OriginalDateTimeFormat = Intl.DateTimeFormat;
    Intl.DateTimeFormat = new Proxy(OriginalDateTimeFormat, {{
        construct: function(target, args) {{
            if (args[1]) {{
                args[1].timeZone = spoof.timezone;
            }} else {{
                args[1] = {{ timeZone: spoof.timezone }};
            }}
            return new target(args[0], args[1]);
        }}
    }});

    // Keep the real device identity; only geography changes.
    var originalUA = navigator.userAgent;
    var originalPlatform = navigator.platform;
    Object.defineProperty(navigator, 'userAgent', {{
        get: function() {{ return originalUA; }}
    }});
    Object.defineProperty(navigator, 'platform', {{
        get: function() {{ return originalPlatform; }}
    }});

    if (window.RTCPeerConnection) {{
        var pc = window.RTCPeerConnection.prototype;
        var originalCreateOffer = pc.createOffer;
        pc.createOffer = function(options) {{
            return originalCreateOffer.call(this, options).then(function(offer) {{
                offer.sdp = offer.sdp.replace(/a=candidate:.*typ host.*\r?\n/g, '');
                return offer;
            }});
        }};
    }}
}})();</script>"#,
        id = OVERRIDE_SCRIPT_ID,
        timezone = spoof.timezone,
        language = spoof.language,
        latitude = spoof.latitude,
        longitude = spoof.longitude,
        accuracy = spoof.accuracy,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_spoof() -> SpoofConfig {
        SpoofConfig {
            timezone: "America/New_York".to_string(),
            language: "en-US".to_string(),
            locale: "en_US".to_string(),
            country_code: "US".to_string(),
            latitude: 40.7128,
            longitude: -74.0060,
            accuracy: 100,
            substitutions: vec![],
        }
    }

    #[test]
    fn test_script_carries_marker_id() {
        let script = build_override_script(&test_spoof());
        assert!(script.starts_with(&format!("<script id=\"{}\">", OVERRIDE_SCRIPT_ID)));
        assert!(script.ends_with("</script>"));
    }

    #[test]
    fn test_script_embeds_profile_values() {
        let script = build_override_script(&test_spoof());
        assert!(script.contains("America/New_York"));
        assert!(script.contains("'en-US'"));
        assert!(script.contains("40.7128"));
        assert!(script.contains("-74.006"));
    }
}
