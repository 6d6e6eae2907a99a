//! PROPFIND / LOCK response XML generation.

use portico_storage::locks_repo::Lock;

pub(super) fn xml_escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(ch),
        }
    }
    out
}

#[derive(Debug, Clone)]
pub(super) struct DavEntry {
    pub href: String,
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
    pub modified_ms: Option<i64>,
    pub content_type: Option<String>,
}

fn http_date(modified_ms: i64) -> Option<String> {
    let secs = modified_ms / 1000;
    let t = std::time::UNIX_EPOCH + std::time::Duration::from_secs(secs.max(0) as u64);
    Some(httpdate::fmt_http_date(t))
}

pub(super) fn multistatus(entries: &[DavEntry]) -> String {
    let mut xml = String::from(
        "<?xml version=\"1.0\" encoding=\"utf-8\"?>\n<D:multistatus xmlns:D=\"DAV:\">",
    );
    for entry in entries {
        xml.push_str("<D:response><D:href>");
        xml.push_str(&xml_escape(&entry.href));
        xml.push_str("</D:href><D:propstat><D:prop>");

        xml.push_str("<D:displayname>");
        xml.push_str(&xml_escape(&entry.name));
        xml.push_str("</D:displayname>");

        if entry.is_dir {
            xml.push_str("<D:resourcetype><D:collection/></D:resourcetype>");
        } else {
            xml.push_str("<D:resourcetype/>");
            xml.push_str(&format!(
                "<D:getcontentlength>{}</D:getcontentlength>",
                entry.size
            ));
            if let Some(content_type) = entry.content_type.as_deref() {
                xml.push_str("<D:getcontenttype>");
                xml.push_str(&xml_escape(content_type));
                xml.push_str("</D:getcontenttype>");
            }
        }
        if let Some(date) = entry.modified_ms.and_then(http_date) {
            xml.push_str("<D:getlastmodified>");
            xml.push_str(&date);
            xml.push_str("</D:getlastmodified>");
        }

        xml.push_str("<D:supportedlock><D:lockentry><D:lockscope><D:exclusive/></D:lockscope>");
        xml.push_str("<D:locktype><D:write/></D:locktype></D:lockentry></D:supportedlock>");
        xml.push_str("</D:prop><D:status>HTTP/1.1 200 OK</D:status></D:propstat></D:response>");
    }
    xml.push_str("</D:multistatus>");
    xml
}

pub(super) fn lockdiscovery(lock: &Lock) -> String {
    let timeout = lock.expires_at - time::OffsetDateTime::now_utc().unix_timestamp();
    format!(
        concat!(
            "<?xml version=\"1.0\" encoding=\"utf-8\"?>\n",
            "<D:prop xmlns:D=\"DAV:\"><D:lockdiscovery><D:activelock>",
            "<D:locktype><D:write/></D:locktype>",
            "<D:lockscope><D:{scope}/></D:lockscope>",
            "<D:depth>{depth}</D:depth>",
            "<D:owner>{owner}</D:owner>",
            "<D:timeout>Second-{timeout}</D:timeout>",
            "<D:locktoken><D:href>{token}</D:href></D:locktoken>",
            "</D:activelock></D:lockdiscovery></D:prop>"
        ),
        scope = lock.scope,
        depth = lock.depth,
        owner = xml_escape(&lock.owner),
        timeout = timeout.max(0),
        token = xml_escape(&lock.token),
    )
}
