/// Ordered paragraph accumulator for resource descriptions.
///
/// Blocks are appended in presentation order and rendered once at the end.
/// Markup conversion is a downstream concern; this type only owns block
/// ordering and separation.
#[derive(Clone, Debug, Default)]
pub struct DescriptionBuilder {
    blocks: Vec<Block>,
}

#[derive(Clone, Debug)]
enum Block {
    Text(String),
    Blank,
}

/// Result of rendering a [`DescriptionBuilder`].
#[derive(Clone, Debug, PartialEq)]
pub struct RenderedDescription {
    /// Final description text, blocks separated by blank lines.
    pub text: String,
    /// Non-fatal rendering notes; callers log these tagged with the owning
    /// record identifier.
    pub warnings: Vec<String>,
}

impl DescriptionBuilder {
    /// Empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder seeded with one initial block (skipped when empty).
    pub fn with_initial(initial: &str) -> Self {
        let mut builder = Self::new();
        builder.append(initial);
        builder
    }

    /// Append one paragraph block. Empty or whitespace-only input is dropped.
    pub fn append(&mut self, text: &str) {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return;
        }
        self.blocks.push(Block::Text(trimmed.to_string()));
    }

    /// Force an extra blank line at this position.
    pub fn blank_line(&mut self) {
        self.blocks.push(Block::Blank);
    }

    /// True when no text block has been appended.
    pub fn is_empty(&self) -> bool {
        !self
            .blocks
            .iter()
            .any(|block| matches!(block, Block::Text(_)))
    }

    /// Render all blocks to the final text, separating blocks by one blank
    /// line. A block carrying interior blank lines is flattened so block
    /// boundaries stay the only paragraph breaks; each flattening is
    /// reported as a warning.
    pub fn render(&self) -> RenderedDescription {
        let mut warnings = Vec::new();
        let mut paragraphs: Vec<String> = Vec::new();
        for (idx, block) in self.blocks.iter().enumerate() {
            match block {
                Block::Text(text) => {
                    if text.contains("\n\n") {
                        warnings.push(format!("block {idx} contained embedded blank lines"));
                        let flattened = text
                            .split('\n')
                            .map(str::trim_end)
                            .filter(|line| !line.is_empty())
                            .collect::<Vec<_>>()
                            .join("\n");
                        paragraphs.push(flattened);
                    } else {
                        paragraphs.push(text.clone());
                    }
                }
                Block::Blank => paragraphs.push(String::new()),
            }
        }
        RenderedDescription {
            text: paragraphs.join("\n\n"),
            warnings,
        }
    }
}
