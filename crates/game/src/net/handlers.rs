//! Default message handlers for the server and client roles.

use glam::Vec3;
use log::{debug, info, trace, warn};

use super::connection::ConnectionState;
use super::dispatch::{DispatchTable, MessageContext};
use super::event::{DisconnectReason, NetCommand, NetEvent};
use super::protocol::{Channel, DISCOVER_SIGNATURE, MessageType, ServerInfo};
use super::tracking::AckData;
use super::wire::{BufferReader, WireError};
use crate::ecs::{
    ActionState, Body, ComponentKind, ConnectionComponent, EntityFlags, Input,
    NetworkStatsComponent,
};
use crate::replication::Neighbors;
use crate::simulation::ActionSystem;

type HandlerResult = Result<(), WireError>;

/// Handlers the server installs: discovery, handshake and player actions on
/// top of the shared set.
pub fn server_table() -> DispatchTable {
    let mut table = DispatchTable::new();
    register_common(&mut table);
    table.register_fn(MessageType::DiscoverServer, on_discover_server);
    table.register_fn(MessageType::Connect, on_connect);
    table.register_fn(MessageType::Action, on_action);
    table
}

/// Handlers the client installs: handshake reply and everything replication
/// sends its way.
pub fn client_table() -> DispatchTable {
    let mut table = DispatchTable::new();
    register_common(&mut table);
    table.register_fn(MessageType::ServerInfo, on_server_info);
    table.register_fn(MessageType::ConnectConfirm, on_connect_confirm);
    table.register_fn(MessageType::EcsEntCreate, on_entity_create);
    table.register_fn(MessageType::EcsEntDestroy, on_entity_destroy);
    table.register_fn(MessageType::EcsComp, on_component);
    table.register_fn(MessageType::EcsCompAdd, on_component);
    table.register_fn(MessageType::EcsCompAlways, on_component_always);
    table.register_fn(MessageType::EcsCompRemove, on_component_remove);
    table.register_fn(MessageType::EcsFlag, on_flag);
    table.register_fn(MessageType::PlayerData, on_player_data);
    table
}

fn register_common(table: &mut DispatchTable) {
    table.register_fn(MessageType::Ping, on_ping);
    table.register_fn(MessageType::Ack, on_ack);
    table.register_fn(MessageType::Disconnect, on_disconnect);
    table.register_fn(MessageType::Test, on_test);
}

fn on_ping(ctx: &mut MessageContext<'_>, reader: &mut BufferReader<'_>) -> HandlerResult {
    let is_request = reader.read_bool()?;
    if is_request {
        if let Err(e) = ctx.connection.send_message(MessageType::Ping, |w| {
            w.write_bool(false);
            Ok(())
        }) {
            debug!("{}: pong deferred: {e}", ctx.connection.addr());
        }
        return Ok(());
    }

    if let Some(rtt) = ctx.connection.complete_ping(ctx.now) {
        let addr = ctx.connection.addr();
        trace!("{addr}: rtt {rtt:?}");
        ctx.emit(NetEvent::PingMeasured { addr, rtt });
    }
    Ok(())
}

fn on_ack(ctx: &mut MessageContext<'_>, reader: &mut BufferReader<'_>) -> HandlerResult {
    let channel = Channel::try_from(reader.read_u8()?)?;
    let ack = AckData {
        next_expected: reader.read_u16()?,
        bitmask: reader.read_u64()?,
    };
    let acked = ctx.connection.apply_ack(channel, ack);
    if acked > 0 {
        trace!("{}: {acked} acked on {channel:?}", ctx.connection.addr());
    }
    Ok(())
}

fn on_disconnect(ctx: &mut MessageContext<'_>, _reader: &mut BufferReader<'_>) -> HandlerResult {
    let addr = ctx.connection.addr();
    ctx.command(NetCommand::Disconnect {
        addr,
        reason: DisconnectReason::Remote,
    });
    Ok(())
}

fn on_test(ctx: &mut MessageContext<'_>, reader: &mut BufferReader<'_>) -> HandlerResult {
    debug!(
        "{}: TEST message, {} bytes",
        ctx.connection.addr(),
        reader.remaining()
    );
    reader.skip(reader.remaining())
}

fn on_discover_server(
    ctx: &mut MessageContext<'_>,
    reader: &mut BufferReader<'_>,
) -> HandlerResult {
    let signature = reader.read_bytes(DISCOVER_SIGNATURE.len())?;
    if signature != DISCOVER_SIGNATURE {
        debug!("{}: discovery probe with bad signature", ctx.connection.addr());
        return Ok(());
    }

    let info = ServerInfo {
        name: ctx.config.server_name.clone(),
        players: u16::try_from(ctx.connection_count).unwrap_or(u16::MAX),
        max_players: u16::try_from(ctx.config.max_connections).unwrap_or(u16::MAX),
    };
    if let Err(e) = ctx
        .connection
        .send_message(MessageType::ServerInfo, |w| w.write_archived(&info))
    {
        warn!("{}: could not answer discovery: {e}", ctx.connection.addr());
    }
    Ok(())
}

fn on_connect(ctx: &mut MessageContext<'_>, _reader: &mut BufferReader<'_>) -> HandlerResult {
    let addr = ctx.connection.addr();
    if ctx.connection.is_connected() {
        trace!("{addr}: repeated CONNECT ignored");
        return Ok(());
    }

    if ctx.connection_count >= ctx.config.max_connections {
        info!("{addr}: refused, server full ({} peers)", ctx.connection_count);
        if let Err(e) = ctx.connection.send_message(MessageType::Disconnect, |_| Ok(())) {
            warn!("{addr}: could not send refusal: {e}");
        }
        return Ok(());
    }

    let entity = ctx.world.spawn_player(Vec3::ZERO);
    ctx.world.insert(entity, ConnectionComponent { addr });
    ctx.world.insert(entity, Neighbors::default());
    ctx.world.insert(entity, NetworkStatsComponent::default());

    ctx.connection.set_entity(Some(entity));
    ctx.connection.set_state(ConnectionState::Connected);

    let tick = ctx.world.tick();
    if let Err(e) = ctx.connection.send_message(MessageType::ConnectConfirm, |w| {
        w.write_u64(entity.to_bits());
        w.write_u32(tick);
        Ok(())
    }) {
        warn!("{addr}: CONNECT_CONFIRM deferred: {e}");
    }

    info!("{addr} connected as {entity}");
    ctx.command(NetCommand::Accept);
    ctx.emit(NetEvent::Connected {
        addr,
        entity: Some(entity),
    });
    Ok(())
}

fn on_action(ctx: &mut MessageContext<'_>, reader: &mut BufferReader<'_>) -> HandlerResult {
    let tick = reader.read_u32()?;
    let action: ActionState = reader.read_archived()?;

    let Some(entity) = ctx.entity else {
        return Ok(());
    };
    if let Some(input) = ctx.world.get_mut::<Input>(entity) {
        // Unreliable, so an older action can land after a newer one.
        if tick >= input.tick {
            *input = Input { action, tick };
        }
    }
    Ok(())
}

fn on_server_info(ctx: &mut MessageContext<'_>, reader: &mut BufferReader<'_>) -> HandlerResult {
    let info: ServerInfo = reader.read_archived()?;
    let addr = ctx.connection.addr();
    debug!("found server {:?} at {addr}", info.name);
    ctx.emit(NetEvent::ServerDiscovered { addr, info });
    Ok(())
}

fn on_connect_confirm(
    ctx: &mut MessageContext<'_>,
    reader: &mut BufferReader<'_>,
) -> HandlerResult {
    let remote = reader.read_u64()?;
    let tick = reader.read_u32()?;
    let addr = ctx.connection.addr();

    if ctx.connection.is_connected() {
        return Ok(());
    }

    let entity = ctx.world.spawn_player(Vec3::ZERO);
    ctx.connection.map_remote(remote, entity);
    ctx.connection.set_entity(Some(entity));
    ctx.connection.set_state(ConnectionState::Connected);
    ctx.world.set_tick(tick);

    info!("connected to {addr} as {entity} at tick {tick}");
    ctx.emit(NetEvent::Connected {
        addr,
        entity: Some(entity),
    });
    Ok(())
}

fn on_entity_create(ctx: &mut MessageContext<'_>, reader: &mut BufferReader<'_>) -> HandlerResult {
    let remote = reader.read_u64()?;
    if ctx.connection.local_for(remote).is_some() {
        trace!("entity {remote:#x} already known");
        return Ok(());
    }
    // Flags arrive in the first ECS_FLAG as a diff against an empty set.
    let local = ctx.world.spawn();
    ctx.connection.map_remote(remote, local);
    Ok(())
}

fn on_entity_destroy(ctx: &mut MessageContext<'_>, reader: &mut BufferReader<'_>) -> HandlerResult {
    let remote = reader.read_u64()?;
    if let Some(local) = ctx.connection.unmap_remote(remote) {
        ctx.world.destroy(local);
    }
    Ok(())
}

fn on_component(ctx: &mut MessageContext<'_>, reader: &mut BufferReader<'_>) -> HandlerResult {
    let remote = reader.read_u64()?;
    let kind = ComponentKind::try_from(reader.read_u8()?)?;

    let local = match ctx.connection.local_for(remote) {
        Some(local) => local,
        None => {
            let local = ctx.world.spawn();
            ctx.connection.map_remote(remote, local);
            local
        }
    };
    ctx.world.read_component(local, kind, reader, None)
}

fn on_component_always(
    ctx: &mut MessageContext<'_>,
    reader: &mut BufferReader<'_>,
) -> HandlerResult {
    let remote = reader.read_u64()?;
    let kind = ComponentKind::try_from(reader.read_u8()?)?;
    let tick = reader.read_u32()?;

    // Unreliable state for something the ordered channel has not set up yet.
    let local = ctx.connection.local_for(remote);
    let Some(local) = local.filter(|&e| ctx.world.has_kind(e, kind)) else {
        return reader.skip(reader.remaining());
    };
    ctx.world.read_component(local, kind, reader, Some(tick))
}

fn on_component_remove(
    ctx: &mut MessageContext<'_>,
    reader: &mut BufferReader<'_>,
) -> HandlerResult {
    let remote = reader.read_u64()?;
    let kind = ComponentKind::try_from(reader.read_u8()?)?;
    if let Some(local) = ctx.connection.local_for(remote) {
        ctx.world.remove_kind(local, kind);
    }
    Ok(())
}

fn on_flag(ctx: &mut MessageContext<'_>, reader: &mut BufferReader<'_>) -> HandlerResult {
    let remote = reader.read_u64()?;
    let diff = EntityFlags::from_bits_retain(reader.read_u16()?);
    if let Some(local) = ctx.connection.local_for(remote) {
        ctx.world.toggle_flags(local, diff);
    }
    Ok(())
}

fn on_player_data(ctx: &mut MessageContext<'_>, reader: &mut BufferReader<'_>) -> HandlerResult {
    let tick = reader.read_u32()?;
    let body: Body = reader.read_archived()?;

    let Some(entity) = ctx.entity else {
        return Ok(());
    };
    if ActionSystem::reconcile(ctx.world, entity, &body) {
        debug!("{entity}: prediction snapped to server state at tick {tick}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tables_cover_their_roles() {
        let server = server_table();
        let client = client_table();

        for ty in [MessageType::Ping, MessageType::Ack, MessageType::Disconnect] {
            assert!(server.contains(ty));
            assert!(client.contains(ty));
        }
        assert!(server.contains(MessageType::Connect));
        assert!(!server.contains(MessageType::EcsEntCreate));
        assert!(client.contains(MessageType::EcsCompAlways));
        assert!(!client.contains(MessageType::Connect));
    }
}
