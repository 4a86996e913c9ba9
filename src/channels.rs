use std::{borrow::Cow, collections::HashMap, sync::Arc};

use crate::{records, Channel, McapError, McapResult, Schema};

/// Collects raw [`records::Channel`] and [`records::SchemaHeader`] records
/// and wires them together into owned [`Channel`] structs.
///
/// Schemas and channels may legally repeat (the writer duplicates them into
/// chunks so chunks are self-contained), but every occurrence of one id must
/// be identical; conflicting duplicates are rejected.
#[derive(Debug, Default)]
pub struct ChannelAccumulator<'a> {
    pub(crate) schemas: HashMap<u16, Arc<Schema<'a>>>,
    pub(crate) channels: HashMap<u16, Arc<Channel<'a>>>,
}

impl<'a> ChannelAccumulator<'a> {
    /// Adds a schema, to be referenced by later channels.
    pub fn add_schema(
        &mut self,
        header: records::SchemaHeader,
        data: Cow<'a, [u8]>,
    ) -> McapResult<()> {
        if header.id == 0 {
            return Err(McapError::InvalidSchemaId);
        }

        let schema = Schema {
            id: header.id,
            name: header.name,
            encoding: header.encoding,
            data,
        };

        if let Some(preexisting) = self.schemas.get(&header.id) {
            if **preexisting != schema {
                return Err(McapError::ConflictingSchemas(schema.name));
            }
            return Ok(());
        }

        self.schemas.insert(header.id, Arc::new(schema));
        Ok(())
    }

    /// Adds a channel, wiring it to its previously-added [`Schema`].
    ///
    /// Fails if the referenced schema hasn't been declared (a schema id of 0
    /// means "schemaless") or if a conflicting channel with this id exists.
    pub fn add_channel(&mut self, chan: records::Channel) -> McapResult<()> {
        let schema = if chan.schema_id == 0 {
            None
        } else {
            match self.schemas.get(&chan.schema_id) {
                Some(s) => Some(s.clone()),
                None => {
                    return Err(McapError::UnknownSchema(chan.topic, chan.schema_id));
                }
            }
        };

        let channel = Channel {
            id: chan.id,
            topic: chan.topic.clone(),
            schema,
            message_encoding: chan.message_encoding,
            metadata: chan.metadata,
        };

        if let Some(preexisting) = self.channels.get(&chan.id) {
            if **preexisting != channel {
                return Err(McapError::ConflictingChannels(chan.topic));
            }
            return Ok(());
        }

        self.channels.insert(chan.id, Arc::new(channel));
        Ok(())
    }

    /// Gets a channel by id.
    pub fn get(&self, chan_id: u16) -> Option<Arc<Channel<'a>>> {
        self.channels.get(&chan_id).cloned()
    }

    /// Iterates over all accumulated channels.
    pub fn channels(&self) -> impl Iterator<Item = &Arc<Channel<'a>>> {
        self.channels.values()
    }
}
