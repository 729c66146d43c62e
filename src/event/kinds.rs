//! Builtin event kinds and their field tables

use super::{Capabilities, EventKindDef, FieldType};

/// Expands a table of kinds into a constructor list.
///
/// Each entry names the wire event, its capability set, and typed fields.
/// Fields not listed here still reach the event through the side-bag.
macro_rules! builtin_event_kinds {
    (
        $(
            $wire:literal [$caps:ident] {
                $( $field:literal : $ty:ident ),* $(,)?
            }
        ),+ $(,)?
    ) => {
        /// Every builtin kind, in registration order.
        pub(crate) fn builtin_kinds() -> Vec<EventKindDef> {
            vec![
                $(
                    EventKindDef::new($wire)
                        .capabilities(Capabilities::$caps)
                        $( .field($field, FieldType::$ty) )*,
                )+
            ]
        }
    };
}

builtin_event_kinds! {
    "Connect" [CONNECTION_STATE] {
        "ProtocolIdentifier": Text,
    },
    "Disconnect" [CONNECTION_STATE] {
        "Reason": Text,
        "Reconnecting": Boolean,
    },
    "Shutdown" [CONNECTION_STATE] {
        "Shutdown": Text,
        "Restart": Boolean,
    },
    "FullyBooted" [NONE] {
        "Status": Text,
        "Uptime": Integer,
        "LastReload": Integer,
    },
    "Reload" [NONE] {
        "Module": Text,
        "Status": Text,
        "Message": Text,
    },
    "Hangup" [NONE] {
        "Channel": Text,
        "Uniqueid": Text,
        "Linkedid": Text,
        "CallerIDNum": Text,
        "CallerIDName": Text,
        "Cause": Integer,
        "Cause-txt": Text,
    },
    "Newchannel" [NONE] {
        "Channel": Text,
        "ChannelState": Integer,
        "ChannelStateDesc": Text,
        "CallerIDNum": Text,
        "CallerIDName": Text,
        "AccountCode": Text,
        "Exten": Text,
        "Context": Text,
        "Uniqueid": Text,
        "Linkedid": Text,
    },
    "Newstate" [NONE] {
        "Channel": Text,
        "ChannelState": Integer,
        "ChannelStateDesc": Text,
        "CallerIDNum": Text,
        "CallerIDName": Text,
        "ConnectedLineNum": Text,
        "ConnectedLineName": Text,
        "Uniqueid": Text,
    },
    "Dial" [NONE] {
        "SubEvent": Text,
        "Channel": Text,
        "Destination": Text,
        "CallerIDNum": Text,
        "CallerIDName": Text,
        "Uniqueid": Text,
        "DestUniqueid": Text,
        "Dialstring": Text,
        "DialStatus": Text,
    },
    "DialBegin" [NONE] {
        "Channel": Text,
        "DestChannel": Text,
        "Uniqueid": Text,
        "DestUniqueid": Text,
        "DialString": Text,
    },
    "DialEnd" [NONE] {
        "Channel": Text,
        "DestChannel": Text,
        "Uniqueid": Text,
        "DestUniqueid": Text,
        "DialStatus": Text,
    },
    "Bridge" [NONE] {
        "Bridgestate": Text,
        "Bridgetype": Text,
        "Channel1": Text,
        "Channel2": Text,
        "Uniqueid1": Text,
        "Uniqueid2": Text,
        "CallerID1": Text,
        "CallerID2": Text,
    },
    "PeerStatus" [NONE] {
        "ChannelType": Text,
        "Peer": Text,
        "PeerStatus": Text,
        "Cause": Text,
        "Address": Text,
        "Time": Integer,
    },
    "PeerEntry" [RESPONSE] {
        "ChannelType": Text,
        "ObjectName": Text,
        "ChanObjectType": Text,
        "IPaddress": Text,
        "IPport": Integer,
        "Dynamic": Boolean,
        "VideoSupport": Boolean,
        "ACL": Boolean,
        "Status": Text,
        "RealtimeDevice": Text,
    },
    "PeerlistComplete" [LIST_TERMINAL] {
        "EventList": Text,
        "ListItems": Integer,
    },
    "Status" [RESPONSE] {
        "Channel": Text,
        "CallerIDNum": Text,
        "CallerIDName": Text,
        "AccountCode": Text,
        "ChannelState": Integer,
        "ChannelStateDesc": Text,
        "Context": Text,
        "Extension": Text,
        "Priority": Integer,
        "Seconds": Integer,
        "BridgedChannel": Text,
        "Uniqueid": Text,
    },
    "StatusComplete" [LIST_TERMINAL] {
        "EventList": Text,
        "ListItems": Integer,
        "Items": Integer,
    },
    "CoreShowChannel" [RESPONSE] {
        "Channel": Text,
        "Uniqueid": Text,
        "Context": Text,
        "Extension": Text,
        "Priority": Integer,
        "ChannelState": Integer,
        "ChannelStateDesc": Text,
        "Application": Text,
        "ApplicationData": Text,
        "CallerIDNum": Text,
        "Duration": Text,
        "BridgeId": Text,
    },
    "CoreShowChannelsComplete" [LIST_TERMINAL] {
        "EventList": Text,
        "ListItems": Integer,
    },
    "OriginateResponse" [RESPONSE] {
        "Response": Text,
        "Channel": Text,
        "Context": Text,
        "Exten": Text,
        "Reason": Integer,
        "Uniqueid": Text,
        "CallerIDNum": Text,
        "CallerIDName": Text,
    },
    "VarSet" [NONE] {
        "Channel": Text,
        "Variable": Text,
        "Value": Text,
        "Uniqueid": Text,
    },
    "Newexten" [NONE] {
        "Channel": Text,
        "Context": Text,
        "Extension": Text,
        "Priority": Integer,
        "Application": Text,
        "AppData": Text,
        "Uniqueid": Text,
    },
    "DTMF" [NONE] {
        "Channel": Text,
        "Uniqueid": Text,
        "Digit": Text,
        "Direction": Text,
        "Begin": Boolean,
        "End": Boolean,
    },
    "DTMFBegin" [NONE] {
        "Channel": Text,
        "Uniqueid": Text,
        "Digit": Text,
        "Direction": Text,
    },
    "DTMFEnd" [NONE] {
        "Channel": Text,
        "Uniqueid": Text,
        "Digit": Text,
        "Direction": Text,
        "DurationMs": Integer,
    },
    "QueueMember" [RESPONSE] {
        "Queue": Text,
        "Name": Text,
        "Location": Text,
        "StateInterface": Text,
        "Membership": Text,
        "Penalty": Integer,
        "CallsTaken": Integer,
        "LastCall": Integer,
        "Status": Integer,
        "Paused": Boolean,
    },
    "QueueParams" [RESPONSE] {
        "Queue": Text,
        "Max": Integer,
        "Strategy": Text,
        "Calls": Integer,
        "Holdtime": Integer,
        "TalkTime": Integer,
        "Completed": Integer,
        "Abandoned": Integer,
        "ServiceLevel": Integer,
        "ServicelevelPerf": Float,
        "Weight": Integer,
    },
    "QueueStatusComplete" [LIST_TERMINAL] {
        "EventList": Text,
        "ListItems": Integer,
    },
    "AgentCalled" [NONE] {
        "Queue": Text,
        "AgentCalled": Text,
        "AgentName": Text,
        "Channel": Text,
        "DestChannel": Text,
        "CallerIDNum": Text,
        "Context": Text,
        "Extension": Text,
        "Priority": Integer,
        "Uniqueid": Text,
    },
    "UserEvent" [RESPONSE] {
        "UserEvent": Text,
        "Channel": Text,
        "Uniqueid": Text,
    },
}
