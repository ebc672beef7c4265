//! Primary connection bring-up from the inherited environment.

use tracing::debug;

use core_args::ArgList;
use core_events::{EventRecord, ExternalKind, LABEL_LEN};

use crate::context::{Context, PageKey, register_event};
use crate::preroll::preroll_loop;
use crate::{ContextFlags, SegmentKind, ShmError};

/// Extended open parameters for callers that control their identity.
#[derive(Debug, Default)]
pub struct OpenExt {
    pub kind: SegmentKind,
    pub title: Option<String>,
    pub ident: Option<String>,
    /// Persistent identity; generated when absent.
    pub guid: Option<[u64; 2]>,
}

/// Resolve, authenticate and map the primary connection per the
/// environment, then run preroll unless disabled.
pub fn open(kind: SegmentKind, flags: ContextFlags) -> Result<Context, ShmError> {
    open_ext(
        flags,
        OpenExt {
            kind,
            ..Default::default()
        },
    )
}

pub fn open_ext(flags: ContextFlags, ext: OpenExt) -> Result<Context, ShmError> {
    let env = core_wire::open_env_connection(flags.contains(ContextFlags::CONNECT_LOOP))?;
    let flags = flags | ContextFlags::from_bits_truncate(env.extra_flags);

    let key = match env.key_fd {
        Some(fd) => PageKey::Fd(fd),
        None => PageKey::parse(&env.keyfile),
    };
    let (map, shm_key) = Context::map_key(&env.socket, key, flags)?;

    // identity-bearing opens hold the REGISTER back so title and ident
    // ride along with the caller's GUID
    let manual_register =
        ext.guid.is_some() || ext.title.is_some() || ext.ident.is_some();
    let assemble_flags = if manual_register {
        flags | ContextFlags::NO_REGISTER
    } else {
        flags
    };

    let mut ctx = Context::assemble(
        map,
        env.socket,
        ext.kind,
        assemble_flags,
        ext.guid,
        shm_key,
    )?;
    ctx.hidden.flags = flags;

    if manual_register
        && ext.kind != SegmentKind::Unknown
        && !flags.contains(ContextFlags::NO_REGISTER)
    {
        let mut ev = register_event(ext.kind, ctx.guid());
        if let Some(title) = &ext.title {
            let reg = unsafe { &mut ev.ext_mut().body.register };
            let bytes = title.as_bytes();
            let n = bytes.len().min(LABEL_LEN - 1);
            reg.title[..n].copy_from_slice(&bytes[..n]);
        }
        ctx.enqueue(&ev)?;

        if let Some(ident) = &ext.ident {
            let mut ev = EventRecord::external(ExternalKind::Ident);
            ev.set_message(ident);
            ctx.enqueue(&ev)?;
        }
    }

    if let Some(packed) = &env.args {
        match ArgList::unpack(packed) {
            Ok(args) => ctx.hidden.args = Some(args),
            Err(e) => debug!(target: "shm.open", error = %e, "bad argument string"),
        }
    }

    // remember where we came from so a dead peer has somewhere to go;
    // an explicit fallback wins, relays are not local endpoints
    ctx.hidden.alt_conn = env
        .alternate
        .or(if env.networked { None } else { env.endpoint });

    if ext.kind != SegmentKind::Unknown
        && !ext.kind.is_output()
        && !flags.contains(ContextFlags::NO_ACTIVATE)
    {
        preroll_loop(
            &mut ctx,
            !flags.contains(ContextFlags::NO_ACTIVATE_RESIZE),
        )?;
    }

    Ok(ctx)
}
