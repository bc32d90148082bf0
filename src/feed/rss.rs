//! RSS 2.0 / Atom parser
//!
//! Only the fields the pipeline consumes are extracted: title, link or
//! torrent enclosure, guid/id and publication date.

use anyhow::Result;
use chrono::{DateTime, Utc};
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};

use super::FeedEntry;

/// Parses an RSS or Atom document into entries ordered oldest to newest
///
/// # Arguments
/// * `xml` - The raw XML string of the feed
///
/// # Returns
/// Entries sorted by publish time; entries without a date come first and
/// ties keep document order.
///
/// # Example
/// ```ignore
/// let entries = parse_feed(&xml)?;
/// for entry in &entries {
///     println!("{} -> {}", entry.raw_title, entry.link);
/// }
/// ```
pub fn parse_feed(xml: &str) -> Result<Vec<FeedEntry>> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut entries = Vec::new();
    let mut buf = Vec::new();

    let mut current_item: Option<FeedEntryBuilder> = None;
    let mut current_element: Option<String> = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                let name = element_name(e);

                match name.as_str() {
                    "item" | "entry" => {
                        current_item = Some(FeedEntryBuilder::default());
                    }
                    _ => {
                        if let Some(item) = current_item.as_mut() {
                            item.read_attributes(&name, e);
                        }
                        current_element = Some(name);
                    }
                }
            }
            Ok(Event::Empty(ref e)) => {
                if let Some(item) = current_item.as_mut() {
                    item.read_attributes(&element_name(e), e);
                }
            }
            Ok(Event::End(ref e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).to_string();

                if name == "item" || name == "entry" {
                    if let Some(builder) = current_item.take() {
                        if let Some(entry) = builder.build() {
                            entries.push(entry);
                        }
                    }
                }
                current_element = None;
            }
            Ok(Event::Text(ref e)) => {
                if let (Some(item), Some(element)) = (&mut current_item, &current_element) {
                    let text = e.unescape().unwrap_or_default().to_string();
                    item.set_text(element, text);
                }
            }
            Ok(Event::CData(ref e)) => {
                if let (Some(item), Some(element)) = (&mut current_item, &current_element) {
                    let text = String::from_utf8_lossy(e).trim().to_string();
                    item.set_text(element, text);
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(anyhow::anyhow!(
                    "Error parsing XML at position {}: {:?}",
                    reader.buffer_position(),
                    e
                ));
            }
            _ => {}
        }
        buf.clear();
    }

    // stable: same-timestamp entries keep feed order
    entries.sort_by_key(|entry| entry.published_at);

    Ok(entries)
}

fn element_name(e: &BytesStart) -> String {
    String::from_utf8_lossy(e.name().as_ref()).to_string()
}

/// Builder pattern for constructing FeedEntry during XML parsing
#[derive(Default)]
struct FeedEntryBuilder {
    title: Option<String>,
    link: Option<String>,
    guid: Option<String>,
    enclosure: Option<String>,
    published: Option<String>,
}

impl FeedEntryBuilder {
    fn set_text(&mut self, element: &str, text: String) {
        if text.is_empty() {
            return;
        }
        match element {
            "title" => self.title = Some(text),
            "link" => {
                if self.link.is_none() {
                    self.link = Some(text);
                }
            }
            "guid" | "id" => self.guid = Some(text),
            "pubDate" | "published" => self.published = Some(text),
            "updated" | "dc:date" => {
                if self.published.is_none() {
                    self.published = Some(text);
                }
            }
            _ => {}
        }
    }

    /// `<enclosure url type>` and Atom `<link href rel>`
    fn read_attributes(&mut self, element: &str, e: &BytesStart) {
        let mut url = None;
        let mut mime = None;
        let mut rel = None;

        for attr in e.attributes().flatten() {
            let value = match attr.unescape_value() {
                Ok(v) => v.to_string(),
                Err(_) => continue,
            };
            match attr.key.as_ref() {
                b"url" | b"href" => url = Some(value),
                b"type" => mime = Some(value),
                b"rel" => rel = Some(value),
                _ => {}
            }
        }

        let Some(url) = url else { return };
        match element {
            "enclosure" => {
                let torrent_type = mime.as_deref() == Some("application/x-bittorrent");
                if self.enclosure.is_none() && (torrent_type || is_torrent_link(&url)) {
                    self.enclosure = Some(url);
                }
            }
            "link" => match rel.as_deref() {
                Some("enclosure") => {
                    if self.enclosure.is_none() {
                        self.enclosure = Some(url);
                    }
                }
                None | Some("alternate") => {
                    if self.link.is_none() {
                        self.link = Some(url);
                    }
                }
                _ => {}
            },
            _ => {}
        }
    }

    fn build(self) -> Option<FeedEntry> {
        let raw_title = self.title?;

        // prefer something the download backend can fetch directly
        let link = match (self.enclosure, self.link) {
            (Some(enclosure), _) => enclosure,
            (None, Some(link)) => link,
            (None, None) => return None,
        };

        let id = self
            .guid
            .filter(|guid| !guid.is_empty())
            .unwrap_or_else(|| link.clone());

        let published_at = self.published.as_deref().and_then(parse_date);

        Some(FeedEntry {
            id,
            raw_title,
            link,
            published_at,
        })
    }
}

/// Magnet URIs and `.torrent` URLs
pub fn is_torrent_link(url: &str) -> bool {
    url.starts_with("magnet:") || url.split('?').next().is_some_and(|path| path.ends_with(".torrent"))
}

/// RFC 2822 (RSS) or RFC 3339 (Atom) timestamps
fn parse_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value)
        .or_else(|_| DateTime::parse_from_rfc3339(value))
        .map(|t| t.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            // some feeds (mikan) omit the offset entirely
            chrono::NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
                .ok()
                .map(|t| t.and_utc())
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_RSS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0">
  <channel>
    <title>Releases</title>
    <link>https://example.com</link>
    <item>
      <title>[Group] Great Show - 06 (1080p) [123456].mkv</title>
      <link>https://example.com/view/6</link>
      <guid isPermaLink="false">great-show-06</guid>
      <pubDate>Tue, 07 May 2024 15:00:00 +0000</pubDate>
      <enclosure url="https://example.com/download/6.torrent" length="1" type="application/x-bittorrent"/>
    </item>
    <item>
      <title><![CDATA[[Group] Great Show - 05 (1080p) [ABCDEF].mkv]]></title>
      <link>magnet:?xt=urn:btih:abcdef&amp;dn=great</link>
      <pubDate>Tue, 30 Apr 2024 15:00:00 +0000</pubDate>
    </item>
    <item>
      <title>No link at all</title>
    </item>
  </channel>
</rss>"#;

    const SAMPLE_ATOM: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <title>Atom releases</title>
  <entry>
    <title>[Sub] Other Show S2 - 03 [720p]</title>
    <id>urn:uuid:1225c695-cfb8-4ebb-aaaa-80da344efa6a</id>
    <link href="https://example.org/view/3"/>
    <link rel="enclosure" href="https://example.org/3.torrent"/>
    <updated>2024-05-01T10:00:00Z</updated>
  </entry>
</feed>"#;

    #[test]
    fn test_parse_rss_feed() {
        let entries = parse_feed(SAMPLE_RSS).unwrap();
        assert_eq!(entries.len(), 2);

        // oldest first
        let first = &entries[0];
        assert_eq!(first.raw_title, "[Group] Great Show - 05 (1080p) [ABCDEF].mkv");
        assert_eq!(first.link, "magnet:?xt=urn:btih:abcdef&dn=great");
        assert_eq!(first.id, first.link);

        let second = &entries[1];
        assert_eq!(second.id, "great-show-06");
        assert_eq!(second.link, "https://example.com/download/6.torrent");
        assert!(second.published_at > first.published_at);
    }

    #[test]
    fn test_parse_atom_feed() {
        let entries = parse_feed(SAMPLE_ATOM).unwrap();
        assert_eq!(entries.len(), 1);

        let entry = &entries[0];
        assert_eq!(entry.id, "urn:uuid:1225c695-cfb8-4ebb-aaaa-80da344efa6a");
        assert_eq!(entry.link, "https://example.org/3.torrent");
        assert_eq!(
            entry.published_at,
            Some("2024-05-01T10:00:00Z".parse::<DateTime<Utc>>().unwrap())
        );
    }

    #[test]
    fn test_reparse_is_stable() {
        let first = parse_feed(SAMPLE_RSS).unwrap();
        let second = parse_feed(SAMPLE_RSS).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_invalid_xml() {
        assert!(parse_feed("<rss><channel><item><title>x</item></rss>").is_err());
    }

    #[test]
    fn test_is_torrent_link() {
        assert!(is_torrent_link("magnet:?xt=urn:btih:abc"));
        assert!(is_torrent_link("https://x/file.torrent?key=1"));
        assert!(!is_torrent_link("https://x/view/1"));
    }

    #[test]
    fn test_parse_date_formats() {
        assert!(parse_date("Tue, 30 Apr 2024 15:00:00 -0000").is_some());
        assert!(parse_date("2024-05-01T10:00:00+09:00").is_some());
        assert!(parse_date("2024-05-01T10:00:00.123").is_some());
        assert!(parse_date("yesterday").is_none());
    }
}
