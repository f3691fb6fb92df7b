use roomchat_storage::MessageRecord;

/// Which side of the transcript a message sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Alignment {
    Own,
    Other,
}

/// One rendered transcript row, borrowed from the current snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageRow<'a> {
    pub message: &'a MessageRecord,
    pub alignment: Alignment,
}

impl MessageRow<'_> {
    pub fn is_own(&self) -> bool {
        self.alignment == Alignment::Own
    }
}

/// Classifies rows without reordering them: alignment is presentation only.
pub fn classify_rows<'a>(
    messages: &'a [MessageRecord],
    viewer_id: Option<&str>,
) -> Vec<MessageRow<'a>> {
    messages
        .iter()
        .map(|message| MessageRow {
            message,
            alignment: if viewer_id == Some(message.author_id.as_str()) {
                Alignment::Own
            } else {
                Alignment::Other
            },
        })
        .collect()
}

/// Plain-text transcript for terminal output.
pub fn render_transcript(rows: &[MessageRow<'_>], width: usize) -> String {
    let mut rendered = String::new();

    for row in rows {
        let marker = if row.message.created_at.is_pending() {
            " (sending)"
        } else {
            ""
        };
        let line = match row.alignment {
            Alignment::Own => format!("{}{marker}", row.message.text),
            Alignment::Other => format!(
                "{}: {}{marker}",
                row.message.author_display_name, row.message.text
            ),
        };

        if row.alignment == Alignment::Own {
            let padding = width.saturating_sub(line.chars().count());
            rendered.push_str(&" ".repeat(padding));
        }
        rendered.push_str(&line);
        rendered.push('\n');
    }

    rendered
}
