use url::Url;

/// Domains whose pages are worth giving a Report Source as soon as they load.
pub const DEFAULT_MEDIA_HOSTS: &[&str] = &[
    "youtube.com",
    "music.youtube.com",
    "open.spotify.com",
    "soundcloud.com",
    "bandcamp.com",
    "twitch.tv",
    "vimeo.com",
    "music.apple.com",
    "netflix.com",
    "hulu.com",
    "amazon.com",
    "music.amazon.com",
];

pub fn default_media_hosts() -> Vec<String> {
    DEFAULT_MEDIA_HOSTS.iter().map(|h| h.to_string()).collect()
}

/// Allow-list of media-hosting domains.
///
/// A URL matches when its host equals an allow-listed domain or is a
/// subdomain of one (`www.youtube.com`, `artist.bandcamp.com`).  Look-alike
/// hosts such as `notyoutube.com` do not match.
#[derive(Debug, Clone)]
pub struct MediaHosts {
    domains: Vec<String>,
}

impl MediaHosts {
    pub fn new<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let domains = domains
            .into_iter()
            .map(|d| d.as_ref().trim().trim_start_matches('.').to_ascii_lowercase())
            .filter(|d| !d.is_empty())
            .collect();
        Self { domains }
    }

    pub fn matches(&self, url: &str) -> bool {
        let Ok(parsed) = Url::parse(url) else {
            return false;
        };
        if !matches!(parsed.scheme(), "http" | "https") {
            return false;
        }
        let Some(host) = parsed.host_str() else {
            return false;
        };
        let host = host.to_ascii_lowercase();
        self.domains.iter().any(|domain| {
            host == *domain
                || host
                    .strip_suffix(domain.as_str())
                    .is_some_and(|prefix| prefix.ends_with('.'))
        })
    }
}

impl Default for MediaHosts {
    fn default() -> Self {
        Self::new(DEFAULT_MEDIA_HOSTS)
    }
}
