//! # Protocol Authorization
//!
//! The protocol rule engine: evaluates a protocol definition's action rules
//! against a record's ancestor chain to decide whether an author may write,
//! read, query, subscribe, or delete at a structure node.

use crate::error::Result;
use crate::protocols::{Action, Actor, Definition};
use crate::provider::{BlockStore, KvStore};
use crate::records::{self, RecordsFilter, Write};
use crate::store::ProtocolsQueryBuilder;
use crate::{bad_request, forbidden, store, utils};

/// Protocol-based authorization for record writes.
pub(crate) async fn permit_write<S: BlockStore + KvStore>(
    owner: &str, write: &Write, store_impl: &S,
) -> Result<()> {
    let (protocol, protocol_path) = protocol_of(write)?;
    let author = write.authorization.author()?;

    // the chain excludes the record itself until its initial write commits
    let exclude = if write.is_initial()? { Some(write.record_id.as_str()) } else { None };
    let chain = context_chain(owner, write.context_id.as_deref(), exclude, store_impl).await?;

    authorize(
        owner, &author, Action::Write, protocol, protocol_path, &chain, Some(write), store_impl,
    )
    .await
}

/// Protocol-based authorization for reading a record.
pub(crate) async fn permit_read<S: BlockStore + KvStore>(
    owner: &str, author: &str, write: &Write, store_impl: &S,
) -> Result<()> {
    let (protocol, protocol_path) = protocol_of(write)?;
    let chain = context_chain(owner, write.context_id.as_deref(), None, store_impl).await?;

    authorize(owner, author, Action::Read, protocol, protocol_path, &chain, Some(write),
        store_impl)
    .await
}

/// Protocol-based authorization for deleting a record. Rules are evaluated
/// at the node that governed the record's writes.
pub(crate) async fn permit_delete<S: BlockStore + KvStore>(
    owner: &str, author: &str, write: &Write, store_impl: &S,
) -> Result<()> {
    let (protocol, protocol_path) = protocol_of(write)?;
    let chain = context_chain(owner, write.context_id.as_deref(), None, store_impl).await?;

    authorize(
        owner, author, Action::Delete, protocol, protocol_path, &chain, Some(write), store_impl,
    )
    .await
}

/// Protocol-based authorization for queries and subscriptions over a
/// protocol path.
pub(crate) async fn permit_query<S: BlockStore + KvStore>(
    owner: &str, author: &str, action: Action, filter: &RecordsFilter, store_impl: &S,
) -> Result<()> {
    let Some(protocol) = &filter.protocol else {
        return Err(forbidden!("missing protocol filter"));
    };
    let Some(protocol_path) = &filter.protocol_path else {
        return Err(forbidden!("missing protocol path filter"));
    };
    let chain = context_chain(owner, filter.context_id.as_deref(), None, store_impl).await?;

    authorize(owner, author, action, protocol, protocol_path, &chain, None, store_impl).await
}

/// Performs validation on the structure of protocol record writes: declared
/// type constraints, path shape, and parent linkage.
pub(crate) async fn verify_integrity<S: BlockStore + KvStore>(
    owner: &str, write: &Write, store_impl: &S,
) -> Result<()> {
    let (protocol, protocol_path) = protocol_of(write)?;
    let definition = protocol_definition(owner, protocol, store_impl).await?;

    if definition.rule_set(protocol_path).is_none() {
        return Err(bad_request!("no rule set defined for protocol path {protocol_path}"));
    }
    verify_type(write, &definition)?;
    verify_parent(owner, write, store_impl).await?;

    Ok(())
}

// Verifies the `schema` and `data_format` against the declared type for the
// path's leaf label.
fn verify_type(write: &Write, definition: &Definition) -> Result<()> {
    let (_, protocol_path) = protocol_of(write)?;
    let Some(type_name) = protocol_path.split('/').next_back() else {
        return Err(bad_request!("missing type name"));
    };
    let Some(protocol_type) = definition.types.get(type_name) else {
        return Err(bad_request!("record with type {type_name} not allowed in protocol"));
    };

    if protocol_type.schema.is_some() && protocol_type.schema != write.descriptor.schema {
        return Err(bad_request!("invalid schema for type {type_name}"));
    }
    if let Some(data_formats) = &protocol_type.data_formats {
        if !data_formats.contains(&write.descriptor.data_format) {
            return Err(bad_request!("invalid data format for type {type_name}"));
        }
    }

    Ok(())
}

// Verify the record's path and context agree with its parent record.
async fn verify_parent<S: BlockStore + KvStore>(
    owner: &str, write: &Write, store_impl: &S,
) -> Result<()> {
    let (_, protocol_path) = protocol_of(write)?;
    let Some(type_name) = protocol_path.split('/').next_back() else {
        return Err(bad_request!("missing type name"));
    };

    let Some(parent_id) = &write.descriptor.parent_id else {
        if protocol_path != type_name {
            return Err(bad_request!("invalid protocol path for parentless record"));
        }
        return Ok(());
    };

    let Some(parent) = records::initial_write(owner, parent_id, store_impl).await? else {
        return Err(bad_request!("no parent record found for {parent_id}"));
    };
    if parent.descriptor.protocol != write.descriptor.protocol {
        return Err(bad_request!("parent protocol does not match"));
    }

    // the path extends the parent's path by one label
    let Some(parent_path) = &parent.descriptor.protocol_path else {
        return Err(bad_request!("parent record has no protocol path"));
    };
    if format!("{parent_path}/{type_name}") != protocol_path {
        return Err(bad_request!("invalid protocol path"));
    }

    // the context extends the parent's context by this record's id
    let Some(context_id) = &write.context_id else {
        return Err(bad_request!("missing context id"));
    };
    let Some(parent_context_id) = &parent.context_id else {
        return Err(bad_request!("missing parent context id"));
    };
    if context_id != &format!("{parent_context_id}/{}", write.record_id) {
        return Err(bad_request!("invalid context id"));
    }

    Ok(())
}

// Finds a rule at the structure node that allows the requested action for
// the author, given the record's ancestor chain (root first).
#[allow(clippy::too_many_arguments)]
async fn authorize<S: BlockStore + KvStore>(
    owner: &str, author: &str, action: Action, protocol: &str, protocol_path: &str,
    chain: &[Write], target: Option<&Write>, store_impl: &S,
) -> Result<()> {
    let definition = protocol_definition(owner, protocol, store_impl).await?;

    let Some(rule_set) = definition.rule_set(protocol_path) else {
        return Err(forbidden!("no action rule defined for {protocol_path}"));
    };
    let Some(rules) = &rule_set.actions else {
        return Err(forbidden!("no action rule defined for {protocol_path}"));
    };

    for rule in rules {
        if rule.can != action {
            continue;
        }
        match rule.who {
            Actor::Anyone => return Ok(()),
            Actor::Recipient => {
                let recipient = match &rule.of {
                    Some(of) => ancestor_at(of, chain)?.descriptor.recipient.clone(),
                    None => target.and_then(|write| write.descriptor.recipient.clone()),
                };
                if recipient.as_deref() == Some(author) {
                    return Ok(());
                }
            }
            Actor::Author => {
                let Some(of) = &rule.of else {
                    continue;
                };
                let ancestor = ancestor_at(of, chain)?;
                if ancestor.authorization.author()? == author {
                    return Ok(());
                }
            }
        }
    }

    Err(forbidden!("action not allowed for {author}"))
}

// The ancestor at the rule's `of` path. The path's depth indexes into the
// root-first chain; the ancestor found there must carry the same path.
fn ancestor_at<'a>(of: &str, chain: &'a [Write]) -> Result<&'a Write> {
    let depth = of.split('/').count();
    if depth > chain.len() {
        return Err(forbidden!("rule path {of} is longer than the record's ancestor chain"));
    }

    let ancestor = &chain[depth - 1];
    if ancestor.descriptor.protocol_path.as_deref() != Some(of) {
        return Err(forbidden!("ancestor does not match rule path {of}"));
    }

    Ok(ancestor)
}

// Builds the record chain from a context id: each segment is the entry id
// of an ancestor's initial write, root first. `exclude` skips the target
// record's own (not yet committed) segment.
async fn context_chain<S: BlockStore + KvStore>(
    owner: &str, context_id: Option<&str>, exclude: Option<&str>, store_impl: &S,
) -> Result<Vec<Write>> {
    let Some(context_id) = context_id else {
        return Ok(vec![]);
    };

    let mut chain = vec![];
    for record_id in context_id.split('/') {
        if exclude == Some(record_id) {
            continue;
        }
        let Some(initial) = records::initial_write(owner, record_id, store_impl).await? else {
            return Err(forbidden!("no record found for ancestor {record_id}"));
        };
        chain.push(initial);
    }

    Ok(chain)
}

// Fetches the (latest) installed definition for the protocol.
async fn protocol_definition<S: BlockStore + KvStore>(
    owner: &str, protocol_uri: &str, store_impl: &S,
) -> Result<Definition> {
    let protocol_uri = utils::clean_url(protocol_uri)?;

    let query = ProtocolsQueryBuilder::new().protocol(&protocol_uri).build();
    let (entries, _) = store::message::query(owner, &query, store_impl).await?;

    let Some(entry) = entries.last() else {
        return Err(forbidden!("unable to find protocol definition for {protocol_uri}"));
    };
    let Some(configure) = entry.as_configure() else {
        return Err(forbidden!("unexpected message type"));
    };

    Ok(configure.descriptor.definition.clone())
}

fn protocol_of(write: &Write) -> Result<(&str, &str)> {
    let Some(protocol) = &write.descriptor.protocol else {
        return Err(bad_request!("missing protocol"));
    };
    let Some(protocol_path) = &write.descriptor.protocol_path else {
        return Err(bad_request!("missing protocol path"));
    };
    Ok((protocol, protocol_path))
}
